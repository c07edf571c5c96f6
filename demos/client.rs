use log::*;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::{sleep, Duration};
use ws_endpoint::{Client, ClientConfig, CloseCode, Connection, Handler, Message};

struct CountingHandler {
    received: Mutex<u32>,
}

impl Handler for CountingHandler {
    fn on_message(&self, conn: &Connection, message: Message) {
        match message.as_text() {
            Ok(text) => info!("received: {}", text),
            Err(_) => info!("received {} binary bytes", message.len()),
        }

        let mut received = self.received.lock().unwrap();
        *received += 1;
        // Hang up after a few echoes.
        if *received >= 3 {
            if conn.close(CloseCode::NORMAL, "done").is_err() {
                error!("error occurred when closing connection");
            }
        }
    }

    fn on_close(&self, conn: &Connection) {
        info!("connection closed, clean={}", conn.close_state().was_clean);
    }
}

fn generate_random_string() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect()
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let handler = Arc::new(CountingHandler {
        received: Mutex::new(0),
    });
    let client = Client::new(ClientConfig::default(), handler).expect("invalid client config");

    let pending = client
        .get_connection("ws://127.0.0.1:9002")
        .expect("bad URI");
    match client.connect(pending).await {
        Ok(conn) => {
            for _ in 0..3 {
                if conn.send_text(&generate_random_string()).is_err() {
                    error!("failed to send message");
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
            client.run(false).await;
        }
        Err(err) => error!("error when connecting: {}", err),
    }
}
