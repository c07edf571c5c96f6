use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use ws_endpoint::{Connection, Handler, Message, Server, ServerConfig};

/// Relays every message to all connected clients.
struct BroadcastHandler {
    clients: Mutex<HashMap<Uuid, Connection>>,
}

impl Handler for BroadcastHandler {
    fn on_open(&self, conn: &Connection) {
        info!("client {} joined", conn.id());
        self.clients
            .lock()
            .unwrap()
            .insert(conn.id(), conn.clone());
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        let clients = self.clients.lock().unwrap();
        for (id, peer) in clients.iter() {
            if *id == conn.id() {
                continue;
            }
            if peer.send_message(message.clone()).is_err() {
                warn!("failed to relay to {}", id);
            }
        }
    }

    fn on_close(&self, conn: &Connection) {
        info!("client {} left", conn.id());
        self.clients.lock().unwrap().remove(&conn.id());
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let handler = Arc::new(BroadcastHandler {
        clients: Mutex::new(HashMap::new()),
    });
    let server = Server::new(ServerConfig::default(), handler).expect("invalid server config");
    if let Err(err) = server.listen("127.0.0.1:9002").await {
        error!("server exited: {}", err);
    }
}
