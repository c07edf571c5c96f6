use crate::connection::OutCommand;
use crate::error::Error;
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;

/// Drains the per-connection write queue onto the transport.
///
/// Running as a single task gives the write discipline for free: at most
/// one outstanding write, and frames hit the wire in queue order. A failed
/// write is fatal; the driver observes it through this task's result.
pub(crate) struct Writer<S> {
    write_half: WriteHalf<S>,
    out_rx: UnboundedReceiver<OutCommand>,
    buffered: Arc<AtomicUsize>,
}

impl<S: AsyncWrite + Send + 'static> Writer<S> {
    pub fn new(
        write_half: WriteHalf<S>,
        out_rx: UnboundedReceiver<OutCommand>,
        buffered: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            write_half,
            out_rx,
            buffered,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        while let Some(command) = self.out_rx.recv().await {
            match command {
                OutCommand::Prepared(msg) => {
                    let wire_len = msg.wire_len();
                    self.write_half.write_all(&msg.header).await?;
                    self.write_half.write_all(&msg.payload).await?;
                    self.buffered.fetch_sub(wire_len, Ordering::AcqRel);
                }
                OutCommand::Raw(bytes) => {
                    self.write_half.write_all(&bytes).await?;
                    self.buffered.fetch_sub(bytes.len(), Ordering::AcqRel);
                }
                OutCommand::Shutdown => {
                    trace!("writer draining and shutting transport down");
                    let _ = self.write_half.flush().await;
                    let _ = self.write_half.shutdown().await;
                    break;
                }
            }
        }
        Ok(())
    }
}
