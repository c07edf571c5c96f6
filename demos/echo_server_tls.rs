use log::*;
use pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use ws_endpoint::{Connection, Handler, Message, Server, ServerConfig};

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_message(&self, conn: &Connection, message: Message) {
        if conn.send_message(message).is_err() {
            error!("failed to echo message to {}", conn.id());
        }
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    private_key(&mut BufReader::new(File::open(path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::Other, "no private key found"))
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let certs = load_certs(Path::new("server.crt"))?;
    let key = load_key(Path::new("server.key"))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;

    let config = ServerConfig {
        tls_config: Some(Arc::new(tls_config)),
        ..Default::default()
    };
    let server =
        Server::new(config, Arc::new(EchoHandler)).expect("invalid server config");
    if let Err(err) = server.listen("127.0.0.1:9002").await {
        error!("server exited: {}", err);
    }
    Ok(())
}
