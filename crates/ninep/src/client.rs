//! Asynchronous client side 9P library.
//!
//! A [`Client`] owns one connection. Requests may be issued concurrently from
//! any number of tasks: each takes a tag, writes its frame, and parks on a
//! one-shot channel. A background task reads replies and routes each to the
//! caller waiting on its tag.
//!
//! The connection starts out not versioned. Only [`Client::tversion`] is allowed
//! until a `9P2000` session has been agreed. Any transport failure or malformed
//! reply moves the client to the dead state, after which every call fails.

use {
    crate::{
        error::Error,
        fcall::*,
        io_err, serialize,
        srv::codec,
        tag::TagPool,
        utils::{self, Result, Tracer},
    },
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, trace},
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicU8, AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{Mutex as AsyncMutex, oneshot},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

/// Lifecycle of a client connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Only `Tversion` may be sent.
    NotVersioned,
    /// A `9P2000` session is in place.
    Versioned,
    /// The connection is closed or broken.
    Dead,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::NotVersioned,
            1 => State::Versioned,
            _ => State::Dead,
        }
    }
}

/// Settings for a client connection.
#[derive(Clone)]
pub struct ClientOptions {
    /// Largest message this side accepts; offered in `Tversion` by [`Client::connect`].
    pub msize: u32,
    /// Called with one line per request and per reply.
    pub trace: Option<Tracer>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            msize: MSIZE,
            trace: None,
        }
    }
}

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

struct Shared {
    tags: TagPool,
    pending: Mutex<HashMap<u16, oneshot::Sender<Bytes>>>,
    writer: AsyncMutex<Writer>,
    state: AtomicU8,
    msize: AtomicU32,
    trace: Option<Tracer>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u16, oneshot::Sender<Bytes>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `Dead` and fail every outstanding and future call.
    fn kill(&self) {
        let mut pending = self.pending();
        self.state.store(State::Dead as u8, Ordering::SeqCst);
        // Dropping the senders wakes their callers with an error.
        pending.clear();
        drop(pending);
        self.tags.close();
    }
}

/// Keeps a tag and its pending entry alive for the duration of one call.
struct InFlight<'a> {
    shared: &'a Shared,
    tag: u16,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.tag);
        self.shared.tags.release(self.tag);
    }
}

/// One 9P2000 client connection.
pub struct Client {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl Client {
    /// Wrap an already established byte stream, with default options.
    pub fn new<R, W>(reader: R, writer: W) -> Client
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_options(reader, writer, ClientOptions::default())
    }

    /// Wrap an already established byte stream.
    ///
    /// Must be called from within a tokio runtime; the reply reader is spawned here.
    pub fn with_options<R, W>(reader: R, writer: W, options: ClientOptions) -> Client
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let shared = Arc::new(Shared {
            tags: TagPool::new(),
            pending: Mutex::new(HashMap::new()),
            writer: AsyncMutex::new(codec(u32::MAX).new_write(writer)),
            state: AtomicU8::new(State::NotVersioned as u8),
            msize: AtomicU32::new(options.msize),
            trace: options.trace,
        });

        let framedread = codec(options.msize).new_read(reader);
        let reader = tokio::spawn(read_loop(framedread, shared.clone()));

        Client { shared, reader }
    }

    /// Dial `proto!addr!port` and negotiate `9P2000`.
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Client> {
        let (proto, dial_addr) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
        let msize = options.msize;

        let client = match proto {
            "tcp" => {
                let stream = TcpStream::connect(&dial_addr).await?;
                let (readhalf, writehalf) = stream.into_split();
                Client::with_options(readhalf, writehalf, options)
            }
            "unix" => {
                let stream = UnixStream::connect(&dial_addr).await?;
                let (readhalf, writehalf) = stream.into_split();
                Client::with_options(readhalf, writehalf, options)
            }
            _ => return Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
        };
        info!("connected: {}", dial_addr);

        client.tversion(msize, P92000).await?;
        Ok(client)
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn is_dead(&self) -> bool {
        self.state() == State::Dead
    }

    /// Message size: the local limit before negotiation, the agreed one after.
    pub fn msize(&self) -> u32 {
        self.shared.msize.load(Ordering::SeqCst)
    }

    /// Shut the connection down. Outstanding and later calls fail with `Error::Dead`.
    pub async fn close(&self) {
        self.shared.kill();
        self.reader.abort();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = SinkExt::<Bytes>::close(&mut *writer).await {
            debug!("closing 9P connection: {}", e);
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// `Rerror` comes back as `Error::Str`; a reply of the wrong type is an error too.
    async fn rpc(&self, body: FCall) -> Result<FCall> {
        let shared = &*self.shared;
        match shared.state() {
            State::Dead => return Err(Error::Dead),
            State::NotVersioned if !matches!(body, FCall::TVersion { .. }) => {
                return Err(Error::NotVersioned);
            }
            _ => {}
        }

        let request_type = MsgType::from(&body);
        let tag = shared.tags.acquire().await?;
        let call = InFlight { shared, tag };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = shared.pending();
            if shared.state() == State::Dead {
                return Err(Error::Dead);
            }
            pending.insert(tag, tx);
        }

        let msg = Msg { tag, body };
        let frame = serialize::encode_body(&msg)?;
        trace!("\t→ {:?}", msg);
        utils::trace(&shared.trace, || format!("→ {:?}", msg));

        {
            let mut writer = shared.writer.lock().await;
            if let Err(e) = writer.send(Bytes::from(frame)).await {
                error!("Failed to send {} with tag {}: {}", request_type, tag, e);
                shared.kill();
                return Err(e.into());
            }
        }

        let frame = rx.await.map_err(|_| Error::Dead)?;
        let reply = match serialize::decode_body(&frame) {
            Ok(reply) => reply,
            Err(e) => {
                error!("Malformed reply to {} with tag {}: {}", request_type, tag, e);
                shared.kill();
                return Err(e.into());
            }
        };
        drop(call);

        trace!("\t← {:?}", reply);
        utils::trace(&shared.trace, || format!("← {:?}", reply));

        match reply.body {
            FCall::RError { ename } => Err(Error::Str(ename)),
            body if request_type.reply() == Some(MsgType::from(&body)) => Ok(body),
            body => Err(unexpected(request_type, &body)),
        }
    }

    /// Negotiate the protocol version and message size.
    ///
    /// Anything but `9P2000` in the reply, or an `Rerror`, fails with
    /// `Error::Version` and leaves the client usable for another attempt.
    pub async fn tversion(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        let reply = self
            .rpc(FCall::TVersion {
                msize,
                version: version.to_owned(),
            })
            .await;

        match reply {
            Ok(FCall::RVersion {
                msize: agreed,
                version,
            }) => {
                if version != P92000 {
                    return Err(Error::Version(format!(
                        "server offered version {:?}, want {}",
                        version, P92000
                    )));
                }
                let agreed = agreed.min(msize);
                self.shared.msize.store(agreed, Ordering::SeqCst);
                let _ = self.shared.state.compare_exchange(
                    State::NotVersioned as u8,
                    State::Versioned as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Ok((agreed, version))
            }
            Ok(other) => Err(unexpected(MsgType::TVersion, &other)),
            Err(Error::Str(ename)) => Err(Error::Version(ename)),
            Err(e) => Err(e),
        }
    }

    /// Returns the qid of the authentication file.
    pub async fn tauth(&self, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        match self
            .rpc(FCall::TAuth {
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            FCall::RAuth { aqid } => Ok(aqid),
            other => Err(unexpected(MsgType::TAuth, &other)),
        }
    }

    /// Bind `fid` to the root of `aname`; `afid` is `NOFID` without authentication.
    pub async fn tattach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        match self
            .rpc(FCall::TAttach {
                fid,
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            FCall::RAttach { qid } => Ok(qid),
            other => Err(unexpected(MsgType::TAttach, &other)),
        }
    }

    pub async fn tflush(&self, oldtag: u16) -> Result<()> {
        self.rpc(FCall::TFlush { oldtag }).await.map(|_| ())
    }

    /// Walk from `fid` along `wnames`. Fewer qids than names means a partial walk.
    pub async fn twalk<S: AsRef<str>>(
        &self,
        fid: u32,
        newfid: u32,
        wnames: &[S],
    ) -> Result<Vec<QId>> {
        if wnames.len() > MAXWELEM {
            return Err(Error::Str(crate::errstr::ETOOMANYWNAMES.to_owned()));
        }
        let wnames = wnames.iter().map(|s| s.as_ref().to_owned()).collect();
        match self.rpc(FCall::TWalk { fid, newfid, wnames }).await? {
            FCall::RWalk { wqids } => Ok(wqids),
            other => Err(unexpected(MsgType::TWalk, &other)),
        }
    }

    /// Returns the qid and iounit of the opened file.
    pub async fn topen(&self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.rpc(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::TOpen, &other)),
        }
    }

    pub async fn tcreate(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(QId, u32)> {
        match self
            .rpc(FCall::TCreate {
                fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?
        {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::TCreate, &other)),
        }
    }

    /// `count` is capped so the reply fits in the negotiated message size.
    pub async fn tread(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.msize().saturating_sub(IOHDRSZ));
        match self.rpc(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            other => Err(unexpected(MsgType::TRead, &other)),
        }
    }

    /// Returns the number of bytes the server accepted.
    pub async fn twrite(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let data = Data(data.to_vec());
        match self.rpc(FCall::TWrite { fid, offset, data }).await? {
            FCall::RWrite { count } => Ok(count),
            other => Err(unexpected(MsgType::TWrite, &other)),
        }
    }

    pub async fn tclunk(&self, fid: u32) -> Result<()> {
        self.rpc(FCall::TClunk { fid }).await.map(|_| ())
    }

    pub async fn tremove(&self, fid: u32) -> Result<()> {
        self.rpc(FCall::TRemove { fid }).await.map(|_| ())
    }

    pub async fn tstat(&self, fid: u32) -> Result<Stat> {
        match self.rpc(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            other => Err(unexpected(MsgType::TStat, &other)),
        }
    }

    /// Fields of `stat` left at their `Stat::unchanged` value are not touched.
    pub async fn twstat(&self, fid: u32, stat: Stat) -> Result<()> {
        self.rpc(FCall::TWStat { fid, stat }).await.map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.kill();
        self.reader.abort();
    }
}

fn unexpected(request: MsgType, reply: &FCall) -> Error {
    io_err!(
        InvalidData,
        format!("{} answered with {}", request, MsgType::from(reply))
    )
    .into()
}

async fn read_loop<R>(mut framedread: FramedRead<R, LengthDelimitedCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = framedread.next().await {
        let frame = match frame {
            Ok(frame) => frame.freeze(),
            Err(e) => {
                error!("Failed to read 9P frame: {}", e);
                break;
            }
        };

        let tag = match serialize::peek_header(&frame) {
            Ok((_, tag)) => tag,
            Err(e) => {
                error!("Malformed 9P frame: {}", e);
                break;
            }
        };

        let waiter = shared.pending().remove(&tag);
        match waiter {
            Some(waiter) => {
                if waiter.send(frame).is_err() {
                    trace!("caller of tag {} went away", tag);
                }
            }
            None => trace!("dropping reply with unexpected tag {}", tag),
        }
    }

    debug!("9P connection closed");
    shared.kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    async fn read_request(peer: &mut DuplexStream) -> Msg {
        let mut size = [0u8; 4];
        peer.read_exact(&mut size).await.unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(size) as usize - 4];
        peer.read_exact(&mut body).await.unwrap();
        serialize::decode_body(&body).unwrap()
    }

    async fn reply(peer: &mut DuplexStream, tag: u16, body: FCall) {
        let frame = serialize::encode_frame(&Msg { tag, body }).unwrap();
        peer.write_all(&frame).await.unwrap();
    }

    fn pair() -> (Client, DuplexStream) {
        let (ours, theirs) = duplex(1 << 16);
        let (r, w) = tokio::io::split(ours);
        (Client::new(r, w), theirs)
    }

    #[tokio::test]
    async fn only_version_before_negotiation() {
        let (client, _peer) = pair();
        assert_eq!(client.state(), State::NotVersioned);
        assert!(matches!(
            client.tattach(0, NOFID, "glenda", "").await,
            Err(Error::NotVersioned)
        ));
    }

    #[tokio::test]
    async fn version_reply_sets_msize() {
        let (client, mut peer) = pair();
        let server = tokio::spawn(async move {
            let req = read_request(&mut peer).await;
            assert_eq!(
                req.body,
                FCall::TVersion { msize: 8192, version: P92000.to_owned() }
            );
            reply(
                &mut peer,
                req.tag,
                FCall::RVersion {
                    msize: 4096,
                    version: P92000.to_owned(),
                },
            )
            .await;
            peer
        });

        let (msize, version) = client.tversion(8192, P92000).await.unwrap();
        assert_eq!((msize, version.as_str()), (4096, P92000));
        assert_eq!(client.msize(), 4096);
        assert_eq!(client.state(), State::Versioned);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_version_is_not_fatal() {
        let (client, mut peer) = pair();
        let server = tokio::spawn(async move {
            let req = read_request(&mut peer).await;
            reply(
                &mut peer,
                req.tag,
                FCall::RVersion {
                    msize: 8192,
                    version: VERSION_UNKNOWN.to_owned(),
                },
            )
            .await;
            let req = read_request(&mut peer).await;
            reply(&mut peer, req.tag, FCall::RError { ename: "no".to_owned() }).await;
            peer
        });

        assert!(matches!(client.tversion(8192, "9P3000").await, Err(Error::Version(_))));
        assert!(matches!(
            client.tversion(8192, "9P3000").await,
            Err(Error::Version(ref e)) if e == "no"
        ));
        assert_eq!(client.state(), State::NotVersioned);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_reply_kills_client() {
        let (client, mut peer) = pair();
        let server = tokio::spawn(async move {
            let req = read_request(&mut peer).await;
            // Rversion with a truncated body
            let tag = req.tag.to_le_bytes();
            peer.write_all(&[9, 0, 0, 0, 101, tag[0], tag[1], 0, 0]).await.unwrap();
            peer
        });

        let e = client.tversion(8192, P92000).await.unwrap_err();
        assert!(e.is_fatal());
        assert!(client.is_dead());
        assert!(matches!(client.tversion(8192, P92000).await, Err(Error::Dead)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn hangup_fails_outstanding_calls() {
        let (client, mut peer) = pair();
        let server = tokio::spawn(async move {
            read_request(&mut peer).await;
            drop(peer);
        });

        assert!(matches!(client.tversion(8192, P92000).await, Err(Error::Dead)));
        assert!(client.is_dead());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stray_tags_are_ignored_and_tags_released() {
        let (client, mut peer) = pair();
        let server = tokio::spawn(async move {
            let req = read_request(&mut peer).await;
            reply(&mut peer, req.tag.wrapping_add(100), FCall::RFlush).await;
            reply(
                &mut peer,
                req.tag,
                FCall::RVersion {
                    msize: 8192,
                    version: P92000.to_owned(),
                },
            )
            .await;
            peer
        });

        client.tversion(8192, P92000).await.unwrap();
        assert_eq!(client.shared.tags.available(), NUM_TAGS);
        assert!(client.shared.pending().is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_makes_client_dead() {
        let (client, _peer) = pair();
        client.close().await;
        assert!(client.is_dead());
        assert!(matches!(client.tversion(8192, P92000).await, Err(Error::Dead)));
    }
}
