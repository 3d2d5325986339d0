//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! A connection is served one request at a time: each T-message is decoded,
//! handed to the [`Filesystem`] and answered before the next frame is read.

use {
    crate::{
        error::{Error, string as errstr},
        fcall::*,
        io_err, serialize,
        utils::{self, Result, Tracer},
    },
    async_trait::async_trait,
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{error, info, warn},
    num_traits::FromPrimitive,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, atomic::Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::{Builder, LengthDelimitedCodec},
};

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// Filesystem server trait for implementing 9P2000 servers.
///
/// Implementors can represent an error condition by returning an `Err`, which is
/// sent to the client as `Rerror` carrying [`Error::ename`]. Otherwise, they must
/// return the `FCall` reply matching the request.
///
/// Every operation except [`rattach`](Self::rattach) has a default. Operations a
/// backend leaves alone answer with `Error::Unsupported`.
///
/// # Example
/// ```no_run
/// use ninep::{Result, fcall::{FCall, QId, QIdType}, srv::{Filesystem, FId}};
/// use async_trait::async_trait;
///
/// struct MyFs;
///
/// #[async_trait]
/// impl Filesystem for MyFs {
///     type FId = ();
///
///     async fn rattach(&self,
///                      _fid: &FId<Self::FId>,
///                      _afid: Option<&FId<Self::FId>>,
///                      _uname: &str,
///                      _aname: &str,
/// ) -> Result<FCall> {
///         Ok(FCall::RAttach { qid: QId { typ: QIdType::DIR, version: 0, path: 0 } })
///     }
/// }
/// ```
///
/// # FId Management
///
/// Each fid can store custom state via the associated `FId` type. The server
/// creates it with `Default` for `Tattach`, `Tauth` and `Twalk`, and drops it after
/// `Tclunk` and `Tremove` whether or not the backend succeeded.
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default;

    /// Negotiate protocol version and message size.
    ///
    /// The default accepts exactly `9P2000` and answers `unknown` for anything else.
    /// The server never lets the reply's msize exceed what the client offered.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize,
            version: match ver {
                P92000 => ver.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }

    /// Set up an authentication fid. `afid` is fresh.
    async fn rauth(&self, _afid: &FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TAuth))
    }

    /// Bind `fid` to the root of the tree named by `aname`.
    ///
    /// `afid` is `None` when the client sent `NOFID`.
    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        afid: Option<&FId<Self::FId>>,
        uname: &str,
        aname: &str,
    ) -> Result<FCall>;

    /// Abort a pending operation. Requests are served in order, so by the
    /// time this is called there is nothing left to abort.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Ok(FCall::RFlush)
    }

    /// Walk `wnames` from `fid`, preparing `new` for the destination.
    ///
    /// `new` is only bound if one qid comes back per name. A shorter `RWalk` is a
    /// partial walk and leaves `newfid` unused.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TWalk))
    }

    /// Open the file behind a fid. `mode` is a combination of `om` values.
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TOpen))
    }

    /// Create `name` in the directory behind the fid and open it.
    ///
    /// On success the fid refers to the new file.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TCreate))
    }

    /// Read at most `count` bytes at `offset`.
    ///
    /// For directories the data is a sequence of whole `Stat` entries.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TRead))
    }

    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TWrite))
    }

    /// Forget a fid. The server drops it from its table afterwards regardless.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file behind a fid. The fid is clunked even if this fails.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TRemove))
    }

    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TStat))
    }

    /// Apply the fields of `stat` that are not set to their "don't touch"
    /// value (see `Stat::unchanged`).
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(Error::Unsupported(MsgType::TWStat))
    }
}

/// Settings for one served connection.
#[derive(Clone)]
pub struct ServerOptions {
    /// Largest message the server accepts or offers during negotiation.
    pub msize: u32,
    /// Called with one line per request and per reply.
    pub trace: Option<Tracer>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            msize: MSIZE,
            trace: None,
        }
    }
}

/// Per-connection state: the fid table and the negotiated message size.
struct Session<T> {
    fids: HashMap<u32, FId<T>>,
    /// Largest msize this server accepts
    max_msize: u32,
    /// msize agreed by the last successful Tversion
    msize: u32,
}

impl<T> Session<T> {
    fn new(max_msize: u32) -> Self {
        Session {
            fids: HashMap::new(),
            max_msize,
            msize: max_msize,
        }
    }

    /// Largest Rread payload that still fits in one message.
    fn iounit(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ)
    }
}

pub(crate) fn codec(max_frame: u32) -> Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(max_frame as usize)
        .little_endian();
    builder
}

#[rustfmt::skip]
async fn dispatch_once<Fs>(
    msg: &Msg,
    fs: &Fs,
    session: &mut Session<Fs::FId>,
) -> Result<FCall>
where
    Fs: Filesystem + Sync,
{
    use crate::FCall::*;

    if let TVersion { msize, ref version } = msg.body {
        // A new session: every fid of the old one is gone.
        session.fids.clear();
        let msize = msize.min(session.max_msize);
        return match fs.rversion(msize, version).await? {
            RVersion { msize: offered, version } => {
                let msize = offered.min(msize);
                if version == P92000 {
                    session.msize = msize;
                }
                Ok(RVersion { msize, version })
            }
            other => Ok(other),
        };
    }

    if let Some(n) = msg.body.newfid() {
        let reuses_fid = matches!(msg.body, TWalk { fid, .. } if fid == n);
        if !reuses_fid && session.fids.contains_key(&n) {
            return Err(errstr::EDUPFID.into());
        }
    }

    let newfid = msg.body.newfid().map(|f| FId {
        fid: f,
        aux: Default::default(),
    });

    let iounit = session.iounit();
    let response = {
        let fids = &session.fids;
        let get_fid = |fid: &u32| fids.get(fid).ok_or_else(|| Error::from(errstr::EBADFID));
        let get_newfid = || newfid.as_ref().ok_or_else(|| Error::from(errstr::EBOTCH));

        let fut = match msg.body {
            TAuth { afid: _, ref uname, ref aname }             => fs.rauth(get_newfid()?, uname, aname),
            TAttach { fid: _, afid, ref uname, ref aname }      => {
                let afid = if afid == NOFID { None } else { Some(get_fid(&afid)?) };
                fs.rattach(get_newfid()?, afid, uname, aname)
            }
            TFlush { oldtag: _ }                                => fs.rflush(None),
            TWalk { fid, newfid: _, ref wnames }                => {
                if wnames.len() > MAXWELEM {
                    return Err(errstr::ETOOMANYWNAMES.into());
                }
                fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames)
            }
            TOpen { fid, mode }                                 => fs.ropen(get_fid(&fid)?, mode),
            TCreate { fid, ref name, perm, mode }               => fs.rcreate(get_fid(&fid)?, name, perm, mode),
            TRead { fid, offset, count }                        => fs.rread(get_fid(&fid)?, offset, count.min(iounit)),
            TWrite { fid, offset, ref data }                    => fs.rwrite(get_fid(&fid)?, offset, data),
            TClunk { fid }                                      => fs.rclunk(get_fid(&fid)?),
            TRemove { fid }                                     => fs.rremove(get_fid(&fid)?),
            TStat { fid }                                       => fs.rstat(get_fid(&fid)?),
            TWStat { fid, ref stat }                            => fs.rwstat(get_fid(&fid)?, stat),
            _                                                   => return Err(Error::Unsupported(MsgType::from(&msg.body))),
        };

        fut.await
    };

    /* Drop the fid which the TClunk or TRemove contains, even on failure */
    if let TClunk { fid } | TRemove { fid } = msg.body {
        session.fids.remove(&fid);
    }

    let response = response?;

    let expected = MsgType::from(&msg.body).reply();
    if expected != Some(MsgType::from(&response)) {
        error!("{} answered with {}", MsgType::from(&msg.body), MsgType::from(&response));
        return Err(errstr::EBOTCH.into());
    }

    if let Some(newfid) = newfid {
        let bind = match (&msg.body, &response) {
            (TWalk { wnames, .. }, RWalk { wqids }) => wqids.len() == wnames.len(),
            _ => true,
        };
        if bind {
            session.fids.insert(newfid.fid, newfid);
        }
    }

    Ok(response)
}

/// Serve a single connection with default options until the peer hangs up.
pub async fn dispatch<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Fs: Filesystem + Send + Sync,
    Reader: AsyncRead + Send + std::marker::Unpin,
    Writer: AsyncWrite + Send + std::marker::Unpin,
{
    dispatch_with(filesystem, reader, writer, ServerOptions::default()).await
}

/// Serve a single connection until the peer hangs up.
///
/// Requests whose type is unknown, or is not a T-message, are answered with
/// `Rerror` under the same tag and the loop carries on. A frame that cannot be
/// decoded, or a transport failure, ends the connection with an error.
pub async fn dispatch_with<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
    options: ServerOptions,
) -> Result<()>
where
    Fs: Filesystem + Send + Sync,
    Reader: AsyncRead + Send + std::marker::Unpin,
    Writer: AsyncWrite + Send + std::marker::Unpin,
{
    let mut session = Session::new(options.msize);

    let mut framedread = codec(options.msize).new_read(reader);
    let mut framedwrite = codec(u32::MAX).new_write(writer);

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;
        let (typ, tag) = serialize::peek_header(&bytes)?;

        let response_fcall = match MsgType::from_u8(typ).and_then(|t| t.reply()) {
            None => {
                let name = msg_type_name(typ);
                warn!("\t← {} with tag {}: not a request", name, tag);
                utils::trace(&options.trace, || format!("← {} tag {}", name, tag));
                FCall::RError {
                    ename: format!("Dispatch: {} not supported", name),
                }
            }
            Some(_) => {
                let msg = serialize::decode_body(&bytes)?;
                info!("\t← {:?}", msg);
                utils::trace(&options.trace, || format!("← {:?}", msg));

                dispatch_once(&msg, &filesystem, &mut session)
                    .await
                    .unwrap_or_else(|e| {
                        error!("{}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                        FCall::RError { ename: e.ename() }
                    })
            }
        };

        let mut response = Msg {
            tag,
            body: response_fcall,
        };
        let frozen = match serialize::encode_body(&response) {
            Ok(buf) => buf,
            Err(e) => {
                error!("Failed to serialize response for tag {}: {:?}", tag, e);
                response.body = FCall::RError { ename: e.to_string() };
                serialize::encode_body(&response)?
            }
        };

        utils::trace(&options.trace, || format!("→ {:?}", response));
        framedwrite.send(Bytes::from(frozen)).await?;
        info!("\t→ {:?}", response);
    }

    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str, options: ServerOptions) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        let options = options.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch_with(fs, readhalf, writehalf, options).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Listen on a unix socket until SIGINT or SIGTERM; the socket file is removed on exit.
pub async fn srv_async_unix<Fs>(
    filesystem: Fs,
    addr: impl AsRef<Path>,
    options: ServerOptions,
) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let fs = filesystem.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    let res = dispatch_with(fs, readhalf, writehalf, options).await;
                    if let Err(e) = res {
                        error!("Error: {:?}", e);
                    }
                });
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `filesystem` on `addr`, given as `tcp!host!port` or `unix!path!suffix`.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    srv_async_with(filesystem, addr, ServerOptions::default()).await
}

/// Like [`srv_async`], with explicit per-connection options.
pub async fn srv_async_with<Fs>(filesystem: Fs, addr: &str, options: ServerOptions) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &listen_addr, options).await,
        "unix" => srv_async_unix(filesystem, &listen_addr, options).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
