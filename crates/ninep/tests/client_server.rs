use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::future::join_all;
use ninep::{
    Client, ClientOptions, Error, FCall, Msg, NOFID, NOTAG, P92000, QId, QIdType, Result,
    ServerOptions, Tracer,
    debug::DebugFs,
    serialize,
    srv::{self, FId, Filesystem},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    task::JoinHandle,
};

/// Answers version and attach only; attach is refused until a version was agreed.
#[derive(Clone, Default)]
struct Echo {
    versioned: Arc<AtomicBool>,
}

const ROOT: QId = QId {
    typ: QIdType::DIR,
    version: 0,
    path: 1,
};

#[async_trait]
impl Filesystem for Echo {
    type FId = ();

    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        if ver != P92000 {
            return Err(Error::Version(format!("{} not supported; only {}", ver, P92000)));
        }
        self.versioned.store(true, Ordering::SeqCst);
        Ok(FCall::RVersion {
            msize,
            version: ver.to_owned(),
        })
    }

    async fn rattach(
        &self,
        _fid: &FId<()>,
        _afid: Option<&FId<()>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        if !self.versioned.load(Ordering::SeqCst) {
            return Err(Error::NotVersioned);
        }
        Ok(FCall::RAttach { qid: ROOT })
    }
}

fn serve<Fs>(fs: Fs, options: ServerOptions) -> (DuplexStream, JoinHandle<Result<()>>)
where
    Fs: Filesystem + Send + Sync + 'static,
{
    let (ours, theirs) = duplex(1 << 16);
    let (r, w) = tokio::io::split(theirs);
    (ours, tokio::spawn(srv::dispatch_with(fs, r, w, options)))
}

fn client_of(stream: DuplexStream) -> Client {
    let (r, w) = tokio::io::split(stream);
    Client::new(r, w)
}

async fn send(peer: &mut DuplexStream, tag: u16, body: FCall) {
    let frame = serialize::encode_frame(&Msg { tag, body }).unwrap();
    peer.write_all(&frame).await.unwrap();
}

async fn recv(peer: &mut DuplexStream) -> Msg {
    let mut size = [0u8; 4];
    peer.read_exact(&mut size).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(size) as usize - 4];
    peer.read_exact(&mut body).await.unwrap();
    serialize::decode_body(&body).unwrap()
}

fn tversion(version: &str) -> FCall {
    FCall::TVersion {
        msize: 8192,
        version: version.to_owned(),
    }
}

#[tokio::test]
async fn attach_needs_version_first() {
    let (stream, _server) = serve(Echo::default(), ServerOptions::default());
    let client = client_of(stream);

    assert!(matches!(
        client.tattach(0, NOFID, "glenda", "").await,
        Err(Error::NotVersioned)
    ));

    let (msize, version) = client.tversion(8192, P92000).await.unwrap();
    assert_eq!((msize, version.as_str()), (8192, P92000));
    assert_eq!(client.tattach(0, NOFID, "glenda", "").await.unwrap(), ROOT);
}

#[tokio::test]
async fn refused_version_leaves_connection_usable() {
    let (stream, _server) = serve(DebugFs::new(Echo::default()), ServerOptions::default());
    let client = client_of(stream);

    match client.tversion(8192, "9P3000").await {
        Err(Error::Version(e)) => assert_eq!(e, "9P3000 not supported; only 9P2000"),
        other => panic!("expected a version error, got {:?}", other),
    }
    assert!(!client.is_dead());

    client.tversion(8192, P92000).await.unwrap();
    assert_eq!(client.tattach(0, NOFID, "glenda", "").await.unwrap(), ROOT);
}

#[tokio::test]
async fn msize_is_clamped_to_server_limit() {
    let options = ServerOptions {
        msize: 4096,
        ..Default::default()
    };
    let (stream, _server) = serve(Echo::default(), options);
    let client = client_of(stream);

    let (msize, _) = client.tversion(8192, P92000).await.unwrap();
    assert_eq!(msize, 4096);
    assert_eq!(client.msize(), 4096);
}

#[tokio::test]
async fn server_rejects_attach_before_version() {
    let (mut peer, _server) = serve(Echo::default(), ServerOptions::default());

    send(
        &mut peer,
        5,
        FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    let reply = recv(&mut peer).await;
    assert_eq!(reply.tag, 5);
    assert_eq!(
        reply.body,
        FCall::RError {
            ename: "version must be negotiated first".to_owned()
        }
    );
}

#[tokio::test]
async fn non_requests_get_rerror_with_same_tag() {
    let (mut peer, server) = serve(Echo::default(), ServerOptions::default());

    // unknown opcode, Terror and an R-message
    for (typ, tag, name) in [
        (200u8, 0x0102u16, "message type 200"),
        (106, 7, "Terror"),
        (101, 8, "Rversion"),
    ] {
        let tag_bytes = tag.to_le_bytes();
        peer.write_all(&[7, 0, 0, 0, typ, tag_bytes[0], tag_bytes[1]])
            .await
            .unwrap();
        let reply = recv(&mut peer).await;
        assert_eq!(reply.tag, tag);
        assert_eq!(
            reply.body,
            FCall::RError {
                ename: format!("Dispatch: {} not supported", name)
            }
        );
    }

    send(&mut peer, NOTAG, tversion(P92000)).await;
    let reply = recv(&mut peer).await;
    assert_eq!(reply.tag, NOTAG);
    assert_eq!(
        reply.body,
        FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned()
        }
    );

    drop(peer);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn undecodable_request_ends_connection() {
    let (mut peer, server) = serve(Echo::default(), ServerOptions::default());
    // Tversion whose string runs past the end of the frame
    peer.write_all(&[13, 0, 0, 0, 100, 0, 0, 0, 32, 0, 0, 9, 0])
        .await
        .unwrap();
    assert!(server.await.unwrap().is_err());
}

#[tokio::test]
async fn replies_in_reverse_order_reach_their_callers() {
    const N: u32 = 32;

    let (ours, mut peer) = duplex(1 << 16);
    let client = client_of(ours);

    let fake = tokio::spawn(async move {
        let req = recv(&mut peer).await;
        send(
            &mut peer,
            req.tag,
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        )
        .await;

        let mut reads = Vec::new();
        for _ in 0..N {
            reads.push(recv(&mut peer).await);
        }
        for req in reads.into_iter().rev() {
            let fid = match req.body {
                FCall::TRead { fid, .. } => fid,
                other => panic!("unexpected {:?}", other),
            };
            let data = ninep::Data(fid.to_le_bytes().to_vec());
            send(&mut peer, req.tag, FCall::RRead { data }).await;
        }
        peer
    });

    client.tversion(8192, P92000).await.unwrap();
    let replies = join_all((0..N).map(|fid| client.tread(fid, 0, 4))).await;
    for (fid, data) in (0..N).zip(replies) {
        assert_eq!(data.unwrap(), fid.to_le_bytes().to_vec());
    }
    fake.await.unwrap();
}

#[tokio::test]
async fn hangup_kills_client() {
    let (ours, mut peer) = duplex(1 << 16);
    let client = client_of(ours);

    let fake = tokio::spawn(async move {
        let req = recv(&mut peer).await;
        send(
            &mut peer,
            req.tag,
            FCall::RVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
        )
        .await;
        recv(&mut peer).await;
        drop(peer);
    });

    client.tversion(8192, P92000).await.unwrap();
    assert!(matches!(client.tclunk(0).await, Err(Error::Dead)));
    assert!(client.is_dead());
    assert!(matches!(client.tstat(0).await, Err(Error::Dead)));
    fake.await.unwrap();
}

#[tokio::test]
async fn trace_hooks_see_both_directions() {
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = lines.clone();
    let tracer: Tracer = Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_owned()));

    let options = ServerOptions {
        trace: Some(tracer.clone()),
        ..Default::default()
    };
    let (stream, _server) = serve(Echo::default(), options);
    let (r, w) = tokio::io::split(stream);
    let client = Client::with_options(
        r,
        w,
        ClientOptions {
            trace: Some(tracer),
            ..Default::default()
        },
    );

    client.tversion(8192, P92000).await.unwrap();

    let lines = lines.lock().unwrap();
    // client request, server request, server reply, client reply
    assert_eq!(lines.len(), 4);
    assert_eq!(lines.iter().filter(|l| l.contains("TVersion")).count(), 2);
    assert_eq!(lines.iter().filter(|l| l.contains("RVersion")).count(), 2);
}
