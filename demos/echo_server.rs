use log::*;
use std::sync::Arc;
use ws_endpoint::{Connection, Handler, Message, Server, ServerConfig};

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_open(&self, conn: &Connection) {
        info!("client {} connected", conn.id());
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        if conn.send_message(message).is_err() {
            error!("failed to echo message to {}", conn.id());
        }
    }

    fn on_close(&self, conn: &Connection) {
        info!("client {} disconnected", conn.id());
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = Server::new(ServerConfig::default(), Arc::new(EchoHandler))
        .expect("invalid server config");
    if let Err(err) = server.listen("127.0.0.1:9002").await {
        error!("server exited: {}", err);
    }
}
