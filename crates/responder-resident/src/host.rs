//! Slave side of a resident connection.
//!
//! The host announces itself with `Launched`, loads the module named in
//! `Parameters`, reports the result with `ModuleLoaded` and then answers every
//! `NotifyEvent` with a `NotifyEventAck` carrying the module's result code.

use crate::errors::{WireError, WireResult};
use crate::framing::{PacketReader, PacketWriter};
use crate::module::ModuleRegistry;
use crate::pipe::open_slave;
use crate::protocol::{ModuleLoadCode, Packet};
use crate::state::ResidentState;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub struct ResidentHost {
    registry: ModuleRegistry,
}

impl ResidentHost {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }

    /// Serve the pipe pair rooted at `pipe_base` until the master closes it.
    pub async fn run(&self, pipe_base: &Path) -> WireResult<()> {
        let (receiver, sender) = open_slave(pipe_base).await?;
        info!("Resident host attached to {}", pipe_base.display());
        self.serve(PacketReader::new(receiver), PacketWriter::new(sender))
            .await
    }

    pub async fn serve<R, W>(
        &self,
        mut reader: PacketReader<R>,
        mut writer: PacketWriter<W>,
    ) -> WireResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.send(&Packet::Launched).await?;

        let (module_path, options) = match reader.next().await? {
            Some(Packet::Parameters {
                module_path,
                options,
            }) => (module_path, options),
            Some(other) => {
                return Err(WireError::UnexpectedPacket {
                    state: ResidentState::WaitLaunched,
                    packet: other.packet_type(),
                })
            }
            None => return Ok(()),
        };

        let mut module = match self.registry.load(&module_path, &options) {
            Ok(module) => {
                writer
                    .send(&Packet::ModuleLoaded(ModuleLoadCode::Success))
                    .await?;
                module
            }
            Err(code) => {
                writer.send(&Packet::ModuleLoaded(code)).await?;
                // Stay up until the master reacts; it kills us or closes the pipe.
                while reader.next().await?.is_some() {}
                return Ok(());
            }
        };

        while let Some(packet) = reader.next().await? {
            match packet {
                Packet::NotifyEvent(event) => {
                    debug!(
                        "Notifying {} of event {} (action {})",
                        module.path(),
                        event.event_id,
                        event.action_id
                    );
                    let result = module.notify(&event);
                    writer.send(&Packet::NotifyEventAck(result)).await?;
                }
                other => {
                    warn!("Unexpected {} packet from master", other.packet_type());
                    return Err(WireError::UnexpectedPacket {
                        state: ResidentState::Idle,
                        packet: other.packet_type(),
                    });
                }
            }
        }
        info!("Master closed the connection; resident host exiting");
        Ok(())
    }
}
