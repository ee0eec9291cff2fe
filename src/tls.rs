//! TLS stream wrapper bridging an async [`crate::net::TcpStream`] to
//! `openssl` (spec component K).
//!
//! Grounded on `src/detail/posix/openssl_stream.cpp`'s want-read/want-write
//! loop: `openssl::ssl::SslStream` is itself synchronous and expects a
//! blocking (or at least self-contained) `Read`/`Write` transport, so this
//! hands it an in-memory [`Adapter`] instead of the network socket
//! directly, and drives the actual network I/O from the `async fn`s below
//! — reading more ciphertext into the adapter whenever `SslStream`/
//! `Ssl::connect` reports [`ErrorCode::WANT_READ`], flushing the adapter's
//! pending ciphertext over the real stream whenever it reports
//! [`ErrorCode::WANT_WRITE`]. `openssl` was picked, per spec.md §4.8, for
//! the same "want-read/want-write plus per-session hostname/ALPN/verify
//! knobs" shape the original's OpenSSL/WolfSSL bridges (`openssl_stream.cpp`/
//! `wolfssl_stream.cpp`) share.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, HandshakeError, ShutdownResult, Ssl, SslContext, SslContextBuilder, SslFiletype,
    SslMethod, SslStream, SslVerifyMode,
};

use crate::error::Error;
use crate::net::TcpStream;

/// Which side of the handshake this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

fn openssl_error(message: impl std::fmt::Display) -> Error {
    Error::system(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Error {
        openssl_error(e)
    }
}

/// Per-session TLS configuration: certificate chain, private key, verify
/// mode, ALPN protocol list, and min/max protocol version (spec §4.8).
pub struct Context {
    ssl_context: SslContext,
}

impl Context {
    pub fn builder(role: Role) -> Result<ContextBuilder, Error> {
        let method = match role {
            Role::Client => SslMethod::tls_client(),
            Role::Server => SslMethod::tls_server(),
        };
        Ok(ContextBuilder {
            inner: SslContextBuilder::new(method)?,
        })
    }
}

pub struct ContextBuilder {
    inner: SslContextBuilder,
}

impl ContextBuilder {
    pub fn set_verify_peer(mut self, verify: bool) -> ContextBuilder {
        self.inner.set_verify(if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        self
    }

    pub fn set_certificate_chain_file(mut self, path: &Path) -> Result<ContextBuilder, Error> {
        self.inner.set_certificate_chain_file(path)?;
        Ok(self)
    }

    pub fn set_private_key_file(mut self, path: &Path) -> Result<ContextBuilder, Error> {
        self.inner.set_private_key_file(path, SslFiletype::PEM)?;
        Ok(self)
    }

    pub fn set_ca_file(mut self, path: &Path) -> Result<ContextBuilder, Error> {
        self.inner.set_ca_file(path)?;
        Ok(self)
    }

    /// ALPN protocols, wire-encoded (length-prefixed) the way
    /// `SSL_CTX_set_alpn_protos` expects.
    pub fn set_alpn_protocols(mut self, wire_format: &[u8]) -> Result<ContextBuilder, Error> {
        self.inner.set_alpn_protos(wire_format)?;
        Ok(self)
    }

    pub fn build(self) -> Context {
        Context {
            ssl_context: self.inner.build(),
        }
    }
}

/// A non-blocking, purely in-memory bridge between `openssl`'s synchronous
/// `Read`/`Write` expectations and the staging buffers the async engine
/// fills and drains. Never touches the network itself.
struct Adapter {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
}

impl Adapter {
    fn new() -> Adapter {
        Adapter {
            incoming: VecDeque::new(),
            outgoing: Vec::new(),
        }
    }
}

impl Read for Adapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = self.incoming.len().min(buf.len());
        for slot in &mut buf[..n] {
            *slot = self.incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for Adapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sends whatever ciphertext `SslStream`'s last call queued into the
/// adapter, then, unless `write_only` (the caller already knows it wants
/// `WANT_WRITE`, not `WANT_READ`), pulls one chunk of fresh ciphertext off
/// the wire.
async fn pump(inner: &TcpStream, adapter: &mut Adapter, write_only: bool) -> Result<(), Error> {
    let mut offset = 0;
    while offset < adapter.outgoing.len() {
        let n = inner.write_some(&adapter.outgoing[offset..]).await?;
        offset += n;
    }
    adapter.outgoing.clear();

    if write_only {
        return Ok(());
    }

    let mut buf = [0u8; 16 * 1024];
    // A clean `eof` here means the underlying TCP connection closed while
    // the TLS engine was still mid-handshake/record, i.e. without a
    // close_notify — spec §4.8/§7 calls that `stream_truncated`, distinct
    // from the `eof` a completed `close_notify` produces via `ZERO_RETURN`.
    let n = match inner.read_some(&mut buf).await {
        Err(e) if e.kind() == crate::error::ErrorKind::Eof => return Err(Error::stream_truncated()),
        other => other?,
    };
    adapter.incoming.extend(buf[..n].iter().copied());
    Ok(())
}

/// Performs the TLS handshake over `inner`, bridging `openssl`'s
/// want-read/want-write reporting to real, async network I/O via
/// [`pump`].
pub async fn handshake(
    inner: TcpStream,
    ctx: &Context,
    role: Role,
    sni_hostname: Option<&str>,
) -> Result<TlsStream, Error> {
    debug!("starting TLS handshake; role={role:?}");
    let mut ssl = Ssl::new(&ctx.ssl_context)?;
    if let (Role::Client, Some(host)) = (role, sni_hostname) {
        ssl.set_hostname(host)?;
    }

    let mut attempt = match role {
        Role::Client => ssl.connect(Adapter::new()),
        Role::Server => ssl.accept(Adapter::new()),
    };

    loop {
        match attempt {
            Ok(stream) => {
                debug!("TLS handshake complete; role={role:?}");
                return Ok(TlsStream {
                    inner,
                    ssl: Mutex::new(stream),
                });
            }
            Err(HandshakeError::WouldBlock(mut mid)) => {
                let write_only = mid.error().code() == ErrorCode::WANT_WRITE;
                pump(&inner, mid.get_mut(), write_only).await?;
                attempt = mid.handshake();
            }
            Err(HandshakeError::SetupFailure(e)) => return Err(openssl_error(e)),
            Err(HandshakeError::Failure(mid)) => {
                return Err(openssl_error(mid.error()));
            }
        }
    }
}

/// An established, bidirectionally-encrypted TCP connection.
///
/// Per spec §4.8, both halves (application reads and writes) share the
/// one mutual-exclusion lock below over the underlying `SslStream`, since
/// a renegotiation triggered by one side touches shared OpenSSL state the
/// other side's call must not observe mid-update.
pub struct TlsStream {
    inner: TcpStream,
    ssl: Mutex<SslStream<Adapter>>,
}

impl TlsStream {
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let outcome = {
                let mut ssl = self.ssl.lock().unwrap();
                ssl.ssl_read(buf)
            };
            match outcome {
                Ok(0) => return Err(Error::eof()),
                Ok(n) => return Ok(n),
                Err(e) => self.drive_or_fail(e).await?,
            }
        }
    }

    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let outcome = {
                let mut ssl = self.ssl.lock().unwrap();
                ssl.ssl_write(buf)
            };
            match outcome {
                Ok(n) => return Ok(n),
                Err(e) => self.drive_or_fail(e).await?,
            }
        }
    }

    /// Sends `close_notify` and waits for the peer's, distinguishing a
    /// clean close from the peer simply vanishing mid-record (spec §4.8:
    /// the latter is [`Error::stream_truncated`], not [`Error::eof`]).
    pub async fn shutdown(&self) -> Result<(), Error> {
        loop {
            let outcome = {
                let mut ssl = self.ssl.lock().unwrap();
                ssl.shutdown()
            };
            match outcome {
                Ok(ShutdownResult::Sent) => continue,
                Ok(ShutdownResult::Received) => return Ok(()),
                Err(e) => self.drive_or_fail(e).await?,
            }
        }
    }

    /// Runs one pump cycle for a `want_read`/`want_write` result from
    /// `ssl_read`/`ssl_write`/`shutdown`, or maps anything else (a clean
    /// `ZeroReturn` close_notify, or an underlying-stream EOF without one)
    /// onto this crate's error taxonomy.
    ///
    /// The mutex is never held across an `.await`: each staging buffer is
    /// taken out (or handed back in) under the lock, with the actual
    /// network `read_some`/`write_some` call made afterward on a plain
    /// `&TcpStream`.
    async fn drive_or_fail(&self, e: openssl::ssl::Error) -> Result<(), Error> {
        let outgoing = {
            let mut guard = self.ssl.lock().unwrap();
            std::mem::take(&mut guard.get_mut().outgoing)
        };
        let mut offset = 0;
        while offset < outgoing.len() {
            let n = self.inner.write_some(&outgoing[offset..]).await?;
            offset += n;
        }

        match e.code() {
            ErrorCode::WANT_WRITE => Ok(()),
            ErrorCode::WANT_READ => {
                let mut buf = [0u8; 16 * 1024];
                let n = match self.inner.read_some(&mut buf).await {
                    Err(e) if e.kind() == crate::error::ErrorKind::Eof => {
                        return Err(Error::stream_truncated())
                    }
                    other => other?,
                };
                let mut guard = self.ssl.lock().unwrap();
                guard.get_mut().incoming.extend(buf[..n].iter().copied());
                Ok(())
            }
            ErrorCode::ZERO_RETURN => Err(Error::eof()),
            ErrorCode::SYSCALL if e.io_error().is_none() => Err(Error::stream_truncated()),
            _ => Err(openssl_error(e)),
        }
    }
}
