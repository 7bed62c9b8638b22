// Local port forwarding through an SSH bastion
//
// libssh2 sessions are blocking and not shareable across threads, so each
// tunnel owns one session and one forwarding thread. The thread polls the
// loopback listener and every forwarded channel in non-blocking mode until
// the tunnel is closed.

use crate::connection::dial::map_io_error;
use crate::errors::RawConnectionError;
use crate::models::{Endpoint, SshSettings};
use ssh2::{Channel, Session};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const IDLE_WAIT: Duration = Duration::from_millis(5);
const BUFFER_SIZE: usize = 16 * 1024;

/// A loopback port forwarded to `target` through an SSH server
pub struct SshTunnel {
    local_addr: SocketAddr,
    target: Endpoint,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl SshTunnel {
    /// Connect and authenticate to the SSH server, then start forwarding a
    /// fresh loopback port to `target`
    #[instrument(skip(settings, target), fields(ssh_host = %settings.host, ssh_port = settings.port, forward_to = %target))]
    pub async fn open(
        settings: &SshSettings,
        target: &Endpoint,
        timeout: Duration,
    ) -> Result<Self, RawConnectionError> {
        let settings = settings.clone();
        let target = target.clone();
        tokio::task::spawn_blocking(move || Self::open_blocking(&settings, target, timeout))
            .await
            .map_err(|e| RawConnectionError::Other(format!("SSH tunnel task failed: {}", e)))?
    }

    fn open_blocking(
        settings: &SshSettings,
        target: Endpoint,
        timeout: Duration,
    ) -> Result<Self, RawConnectionError> {
        let address = settings.endpoint().address();
        let after_ms = timeout.as_millis() as u64;

        let resolved = address
            .to_socket_addrs()
            .map_err(|e| RawConnectionError::Unreachable {
                address: address.clone(),
                message: format!("name resolution failed: {}", e),
            })?
            .next()
            .ok_or_else(|| RawConnectionError::Unreachable {
                address: address.clone(),
                message: "name resolved to no addresses".to_string(),
            })?;
        let tcp = TcpStream::connect_timeout(&resolved, timeout)
            .map_err(|e| map_io_error(&address, &e, after_ms))?;

        let mut session = Session::new().map_err(|e| {
            RawConnectionError::Other(format!("Failed to create SSH session: {}", e))
        })?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| RawConnectionError::Protocol(format!(
            "SSH handshake with {} failed: {}",
            address, e
        )))?;

        authenticate(&session, settings)?;
        if !session.authenticated() {
            return Err(RawConnectionError::AuthRejected(format!(
                "SSH authentication for {} failed",
                settings.username
            )));
        }
        // Forwarded channels live as long as the tunnel
        session.set_timeout(0);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.set_nonblocking(true).map(|()| listener))
            .map_err(|e| RawConnectionError::Other(format!("Failed to bind tunnel port: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RawConnectionError::Other(format!("Failed to bind tunnel port: {}", e)))?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            let target = target.clone();
            thread::Builder::new()
                .name(format!("ssh-tunnel-{}", local_addr.port()))
                .spawn(move || forward(session, listener, target, stop))
                .map_err(|e| {
                    RawConnectionError::Other(format!("Failed to start tunnel thread: {}", e))
                })?
        };

        info!(local = %local_addr, "SSH tunnel established");
        Ok(Self {
            local_addr,
            target,
            stop,
            worker,
        })
    }

    /// Loopback endpoint clients connect to instead of the target
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// False once closed or once the forwarding thread gave up
    pub fn is_open(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.worker.is_finished()
    }

    /// Stop forwarding. Forwarded connections are shut down by the worker.
    pub fn close(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            debug!(local = %self.local_addr, forward_to = %self.target, "Closing SSH tunnel");
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

fn authenticate(session: &Session, settings: &SshSettings) -> Result<(), RawConnectionError> {
    let rejected = |e: ssh2::Error| {
        RawConnectionError::AuthRejected(format!(
            "SSH authentication for {} failed: {}",
            settings.username, e
        ))
    };

    match (settings.private_key.as_deref(), settings.password.as_deref()) {
        (Some(key), _) => {
            debug!(username = %settings.username, "Authenticating with SSH key");
            session
                .userauth_pubkey_memory(&settings.username, None, key, settings.passphrase.as_deref())
                .map_err(rejected)
        }
        (None, Some(password)) => {
            debug!(username = %settings.username, "Authenticating with password");
            session
                .userauth_password(&settings.username, password)
                .map_err(rejected)
        }
        (None, None) => Err(RawConnectionError::AuthRejected(
            "SSH settings carry neither a password nor a private key".to_string(),
        )),
    }
}

fn forward(session: Session, listener: TcpListener, target: Endpoint, stop: Arc<AtomicBool>) {
    session.set_blocking(false);
    let mut links: Vec<Link> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        let mut progressed = false;

        match listener.accept() {
            Ok((local, peer)) => {
                progressed = true;
                match open_link(&session, local, &target) {
                    Ok(link) => {
                        debug!(peer = %peer, forward_to = %target, "Forwarding connection");
                        links.push(link);
                    }
                    Err(e) => warn!(forward_to = %target, error = %e, "Failed to open SSH channel"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "SSH tunnel listener failed");
                break;
            }
        }

        links.retain_mut(|link| match link.pump() {
            Ok(moved) => {
                progressed |= moved;
                if link.finished() {
                    link.shutdown();
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                debug!(error = %e, "Forwarded connection failed");
                link.shutdown();
                false
            }
        });

        if !progressed {
            thread::sleep(IDLE_WAIT);
        }
    }

    for link in &mut links {
        link.shutdown();
    }
    debug!(forward_to = %target, "SSH tunnel stopped");
}

fn open_link(session: &Session, local: TcpStream, target: &Endpoint) -> io::Result<Link> {
    session.set_blocking(true);
    let channel = session.channel_direct_tcpip(&target.host, target.port, None);
    session.set_blocking(false);

    let channel = channel.map_err(io::Error::from)?;
    local.set_nonblocking(true)?;
    Ok(Link {
        local,
        channel,
        upstream: Vec::new(),
        downstream: Vec::new(),
        local_eof: false,
        remote_eof: false,
    })
}

/// One forwarded client connection
struct Link {
    local: TcpStream,
    channel: Channel,
    /// Read from the client, not yet written to the channel
    upstream: Vec<u8>,
    /// Read from the channel, not yet written to the client
    downstream: Vec<u8>,
    local_eof: bool,
    remote_eof: bool,
}

impl Link {
    /// Move whatever is ready in both directions. Returns whether any bytes
    /// or end-of-stream markers moved.
    fn pump(&mut self) -> io::Result<bool> {
        let mut progressed = false;
        let mut buf = [0u8; BUFFER_SIZE];

        if !self.local_eof && self.upstream.is_empty() {
            match self.local.read(&mut buf) {
                Ok(0) => {
                    self.local_eof = true;
                    progressed = true;
                }
                Ok(n) => {
                    self.upstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.upstream.is_empty() {
            match self.channel.write(&self.upstream) {
                Ok(n) => {
                    self.upstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.remote_eof && self.downstream.is_empty() {
            match self.channel.read(&mut buf) {
                Ok(0) if self.channel.eof() => {
                    self.remote_eof = true;
                    progressed = true;
                }
                Ok(0) => {}
                Ok(n) => {
                    self.downstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !self.downstream.is_empty() {
            match self.local.write(&self.downstream) {
                Ok(n) => {
                    self.downstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(progressed)
    }

    fn finished(&self) -> bool {
        (self.local_eof && self.upstream.is_empty()) || (self.remote_eof && self.downstream.is_empty())
    }

    fn shutdown(&mut self) {
        let _ = self.channel.close();
        let _ = self.local.shutdown(Shutdown::Both);
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
