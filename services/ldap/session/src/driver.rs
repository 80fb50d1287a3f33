//! Per-socket I/O task.
//!
//! One task owns the stream. It writes queued frames in order, reads and
//! decodes inbound bytes, and applies transport changes (StartTLS upgrade,
//! SASL security layer) between frames so they never race with I/O.
//!
//! ```text
//! read -> [SASL unwrap] -> FrameDecoder -> ResponseMessage::parse -> dispatch
//! frame -> [SASL wrap + length prefix] -> write
//! ```

use crate::connection::ConnectionInner;
use crate::error::LdapError;
use crate::security::SecurityLayer;
use crate::transport::{tls, IoStream};
use bytes::{Bytes, BytesMut};
use ldap_wire::{encode_sasl_buffer, peek_message_id, FrameDecoder, ResponseMessage, SaslBufferDecoder};
use rustls::ClientConfig;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Control messages for the I/O task
pub(crate) enum IoCommand {
    /// Run the TLS handshake over the current stream
    StartTls {
        config: Arc<ClientConfig>,
        server_name: String,
        ack: oneshot::Sender<Result<(), LdapError>>,
    },
    /// Wrap all further traffic with a SASL security layer
    InstallSecurityLayer {
        layer: Box<dyn SecurityLayer>,
        ack: oneshot::Sender<()>,
    },
    /// Flush queued frames and close the stream
    Shutdown { ack: oneshot::Sender<()> },
}

enum Exit {
    /// Closed on request; nothing to report
    Shutdown,
    /// Transport failed or the server went away
    Closed(LdapError),
}

struct SaslState {
    layer: Box<dyn SecurityLayer>,
    decoder: SaslBufferDecoder,
}

pub(crate) struct IoDriver {
    stream: Option<IoStream>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedReceiver<IoCommand>,
    conn: Weak<ConnectionInner>,
    generation: u64,
    frames: FrameDecoder,
    sasl: Option<SaslState>,
    inbound: BytesMut,
    plain: BytesMut,
    read_timeout: Option<Duration>,
    // Since when buffered bytes have not completed a message
    partial_since: Option<Instant>,
}

impl IoDriver {
    pub(crate) fn new(
        stream: IoStream,
        outbound: mpsc::UnboundedReceiver<Bytes>,
        commands: mpsc::UnboundedReceiver<IoCommand>,
        conn: Weak<ConnectionInner>,
        generation: u64,
        max_frame_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream: Some(stream),
            outbound,
            commands,
            conn,
            generation,
            frames: FrameDecoder::with_max_frame_size(max_frame_size),
            sasl: None,
            inbound: BytesMut::with_capacity(READ_BUFFER_SIZE),
            plain: BytesMut::new(),
            read_timeout,
            partial_since: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = self.drive().await;

        // Release the stream and channels before reporting, so close() can
        // finish while the connection handles the loss
        let IoDriver {
            stream,
            outbound,
            commands,
            conn,
            generation,
            ..
        } = self;
        drop(stream);
        drop(outbound);
        drop(commands);

        match exit {
            Exit::Shutdown => debug!("I/O task {} stopped", generation),
            Exit::Closed(err) => {
                debug!("I/O task {} lost transport: {}", generation, err);
                if let Some(conn) = conn.upgrade() {
                    conn.on_transport_closed(generation, err).await;
                }
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        loop {
            let stall = self
                .read_timeout
                .zip(self.partial_since)
                .map(|(limit, since)| (limit, since + limit));
            let Some(stream) = self.stream.as_mut() else {
                return Exit::Closed(LdapError::Closed("transport unavailable".into()));
            };

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(IoCommand::Shutdown { ack }) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return Exit::Shutdown;
                    }
                    Some(IoCommand::StartTls { config, server_name, ack }) => {
                        let result = self.upgrade_tls(config, &server_name).await;
                        let failure = result.as_ref().err().cloned();
                        let _ = ack.send(result);
                        // A failed handshake consumes the stream
                        if let Some(err) = failure.filter(|_| self.stream.is_none()) {
                            return Exit::Closed(err);
                        }
                    }
                    Some(IoCommand::InstallSecurityLayer { layer, ack }) => {
                        debug!("Installing SASL security layer");
                        self.sasl = Some(SaslState {
                            layer,
                            decoder: SaslBufferDecoder::new(),
                        });
                        let _ = ack.send(());
                    }
                    None => return Exit::Shutdown,
                },

                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.write_frame(frame).await {
                            return Exit::Closed(e);
                        }
                    }
                    None => return Exit::Shutdown,
                },

                read = stream.read_buf(&mut self.inbound) => match read {
                    Ok(0) => {
                        return Exit::Closed(LdapError::Closed("connection closed by server".into()));
                    }
                    Ok(n) => {
                        trace!("Read {} bytes", n);
                        match self.on_bytes() {
                            Ok(frames) => self.track_partial(frames),
                            Err(e) => {
                                warn!("Dropping connection after inbound error: {}", e);
                                return Exit::Closed(e);
                            }
                        }
                    }
                    Err(e) => return Exit::Closed(LdapError::io("Read failed", e)),
                },

                _ = tokio::time::sleep_until(stall.map_or_else(Instant::now, |(_, at)| at)), if stall.is_some() => {
                    let limit = stall.map(|(limit, _)| limit).unwrap_or_default();
                    warn!(
                        "Dropping connection: {} buffered bytes did not complete a message within {:?}",
                        self.inbound.len() + self.plain.len(),
                        limit
                    );
                    return Exit::Closed(LdapError::Connect(format!(
                        "Read timed out after {:?} with an incomplete message",
                        limit
                    )));
                },
            }
        }
    }

    async fn write_frame(&mut self, frame: Bytes) -> Result<(), LdapError> {
        let bytes = match self.sasl.as_mut() {
            Some(sasl) => encode_sasl_buffer(&sasl.layer.wrap(&frame)?),
            None => frame,
        };
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LdapError::Closed("transport unavailable".into()))?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| LdapError::io("Write failed", e))?;
        stream
            .flush()
            .await
            .map_err(|e| LdapError::io("Flush failed", e))?;
        trace!("Wrote {} bytes", bytes.len());
        Ok(())
    }

    fn track_partial(&mut self, frames: usize) {
        if self.inbound.is_empty() && self.plain.is_empty() {
            self.partial_since = None;
        } else if frames > 0 || self.partial_since.is_none() {
            self.partial_since = Some(Instant::now());
        }
    }

    /// Returns how many messages were dispatched
    fn on_bytes(&mut self) -> Result<usize, LdapError> {
        match self.sasl.as_mut() {
            Some(sasl) => {
                while let Some(wrapped) = sasl.decoder.decode(&mut self.inbound)? {
                    let plain = sasl.layer.unwrap(&wrapped)?;
                    self.plain.extend_from_slice(&plain);
                }
            }
            None => {
                self.plain.extend_from_slice(&self.inbound);
                self.inbound.clear();
            }
        }

        let mut frames = 0;
        while let Some(frame) = self.frames.decode(&mut self.plain)? {
            self.dispatch(frame)?;
            frames += 1;
        }
        Ok(frames)
    }

    fn dispatch(&self, frame: Bytes) -> Result<(), LdapError> {
        let Some(conn) = self.conn.upgrade() else {
            return Err(LdapError::Closed("connection dropped".into()));
        };

        match ResponseMessage::parse(frame.clone()) {
            Ok(message) => conn.dispatch(message),
            Err(e) => {
                warn!("Failed to decode response: {}", e);
                conn.dispatch_undecodable(peek_message_id(&frame), LdapError::from(e));
            }
        }
        Ok(())
    }

    async fn upgrade_tls(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<(), LdapError> {
        if !self.inbound.is_empty() || !self.plain.is_empty() {
            warn!("Discarding plaintext received before TLS handshake");
            self.inbound.clear();
            self.plain.clear();
            self.partial_since = None;
        }

        match self.stream.take() {
            Some(IoStream::Plain(raw)) => {
                let upgraded = tls::connect_tls(config, raw, server_name).await?;
                self.stream = Some(upgraded);
                Ok(())
            }
            Some(tls) => {
                self.stream = Some(tls);
                Err(LdapError::Connect("TLS already installed".into()))
            }
            None => Err(LdapError::Closed("transport unavailable".into())),
        }
    }

    async fn shutdown(&mut self) {
        while let Ok(frame) = self.outbound.try_recv() {
            if let Err(e) = self.write_frame(frame).await {
                debug!("Dropping queued frames on shutdown: {}", e);
                break;
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }
}
