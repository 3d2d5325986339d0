use {
    async_trait::async_trait,
    clap::Parser,
    filetime::FileTime,
    log::info,
    ninep::{
        debug::DebugFs,
        srv::{FId, Filesystem, ServerOptions, srv_async_with},
        *,
    },
    nix::{fcntl::OFlag, sys::stat::Mode},
    std::{
        io::SeekFrom,
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
};

mod utils;
use crate::utils::*;

// Maximum depth protection:
// Without a depth limit, it's possible to create infinite recursion by mounting
// the 9P filesystem inside its own export directory. For example:
//   - Export directory: /home/user/export
//   - Mount point: /home/user/export/mnt
// Accessing /home/user/export/mnt/mnt/mnt/... would recurse infinitely.
// The max_depth option prevents this by tracking how deep we've traversed
// from the root and returning ELOOP when the limit is exceeded.

enum Opened {
    File(fs::File),
    Dir(DirListing),
}

#[derive(Default)]
struct UfsFId {
    realpath: RwLock<PathBuf>,
    opened: Mutex<Option<Opened>>,
    depth: RwLock<usize>,
    remove_on_clunk: AtomicBool,
}

#[derive(Clone)]
struct Ufs {
    realroot: PathBuf,
    max_depth: usize,
}

impl Ufs {
    fn name_of(&self, path: &Path) -> String {
        if path == self.realroot {
            return "/".to_owned();
        }
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_owned())
    }
}

fn oflags(mode: u8) -> OFlag {
    let mut flags = match mode & 3 {
        om::WRITE => OFlag::O_WRONLY,
        om::RDWR => OFlag::O_RDWR,
        _ => OFlag::O_RDONLY,
    };
    if mode & om::TRUNC != 0 {
        flags |= OFlag::O_TRUNC;
    }
    flags
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

#[async_trait]
impl Filesystem for Ufs {
    type FId = UfsFId;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        {
            let mut realpath = fid.aux.realpath.write().await;
            *realpath = PathBuf::from(&self.realroot);
        }
        {
            let mut depth = fid.aux.depth.write().await;
            *depth = 0;
        }

        Ok(FCall::RAttach {
            qid: get_qid(&self.realroot).await?,
        })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let mut wqids = Vec::new();
        let mut path = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        let mut new_depth = {
            let depth = fid.aux.depth.read().await;
            *depth
        };

        for (i, name) in wnames.iter().enumerate() {
            match name.as_str() {
                "." => {}
                // ".." at the export root stays at the root
                ".." => {
                    if path != self.realroot {
                        path.pop();
                        new_depth = new_depth.saturating_sub(1);
                    }
                }
                name if !is_plain_name(name) => {
                    if i == 0 {
                        return Err(errstr::ENOTFOUND.into());
                    }
                    break;
                }
                name => {
                    new_depth += 1;
                    if new_depth > self.max_depth {
                        return Err(Error::No(errno::ELOOP));
                    }
                    path.push(name);
                }
            }

            let qid = match get_qid(&path).await {
                Ok(qid) => qid,
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    } else {
                        break;
                    }
                }
            };

            wqids.push(qid);
        }

        if wqids.len() == wnames.len() {
            {
                let mut new_realpath = newfid.aux.realpath.write().await;
                *new_realpath = path;
            }
            {
                let mut depth = newfid.aux.depth.write().await;
                *depth = new_depth;
            }
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        let realpath = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };

        let mut opened = fid.aux.opened.lock().await;
        if opened.is_some() {
            return Err(Error::No(errno::EBUSY));
        }

        let qid = get_qid(&realpath).await?;
        if qid.typ.contains(QIdType::DIR) {
            if mode & 3 == om::WRITE || mode & 3 == om::RDWR || mode & om::TRUNC != 0 {
                return Err(errstr::EISDIR.into());
            }
            *opened = Some(Opened::Dir(DirListing::default()));
        } else {
            let fd = nix::fcntl::open(&realpath, oflags(mode), Mode::empty())?;
            *opened = Some(Opened::File(fs::File::from_std(fd.into())));
        }

        if mode & om::RCLOSE != 0 {
            fid.aux.remove_on_clunk.store(true, Ordering::SeqCst);
        }

        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<FCall> {
        if !is_plain_name(name) {
            return Err(errstr::EPERM.into());
        }

        let path = {
            let realpath = fid.aux.realpath.read().await;
            if !fs::metadata(&*realpath).await?.is_dir() {
                return Err(errstr::ENOTDIR.into());
            }
            realpath.join(name)
        };

        let mut opened = fid.aux.opened.lock().await;
        if opened.is_some() {
            return Err(Error::No(errno::EBUSY));
        }

        if perm & dm::DIR != 0 {
            fs::create_dir(&path).await?;
            fs::set_permissions(&path, PermissionsExt::from_mode(perm & 0o777)).await?;
            *opened = Some(Opened::Dir(DirListing::default()));
        } else {
            let oflags = oflags(mode) | OFlag::O_CREAT | OFlag::O_EXCL;
            let omode = Mode::from_bits_truncate(perm & 0o777);
            let fd = nix::fcntl::open(&path, oflags, omode)?;
            *opened = Some(Opened::File(fs::File::from_std(fd.into())));
        }

        let qid = get_qid(&path).await?;
        {
            let mut realpath = fid.aux.realpath.write().await;
            *realpath = path;
        }
        {
            let mut depth = fid.aux.depth.write().await;
            *depth += 1;
        }
        if mode & om::RCLOSE != 0 {
            fid.aux.remove_on_clunk.store(true, Ordering::SeqCst);
        }

        Ok(FCall::RCreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let mut opened = fid.aux.opened.lock().await;
        let buf = match opened.as_mut().ok_or_else(|| INVALID_FID!())? {
            Opened::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;

                let mut buf = Vec::with_capacity(count as usize);
                file.take(count as u64).read_to_end(&mut buf).await?;
                buf
            }
            Opened::Dir(listing) => {
                if offset == 0 {
                    let realpath = fid.aux.realpath.read().await;
                    *listing = DirListing::read(&*realpath).await?;
                } else if offset != listing.offset {
                    return Err(errstr::EBADOFFSET.into());
                }
                listing.next_chunk(count)?
            }
        };

        Ok(FCall::RRead { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        let count = {
            let mut opened = fid.aux.opened.lock().await;
            match opened.as_mut().ok_or_else(|| INVALID_FID!())? {
                Opened::File(file) => {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write(&data.0).await? as u32
                }
                Opened::Dir(_) => return Err(errstr::EISDIR.into()),
            }
        };

        Ok(FCall::RWrite { count })
    }

    async fn rclunk(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        {
            let mut opened = fid.aux.opened.lock().await;
            *opened = None;
        }

        if fid.aux.remove_on_clunk.load(Ordering::SeqCst) {
            let realpath = fid.aux.realpath.read().await;
            remove(&realpath).await?;
        }

        Ok(FCall::RClunk)
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        {
            let mut opened = fid.aux.opened.lock().await;
            *opened = None;
        }

        let realpath = fid.aux.realpath.read().await;
        if *realpath == self.realroot {
            return Err(errstr::EPERM.into());
        }
        remove(&realpath).await?;

        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let realpath = fid.aux.realpath.read().await;
        let attr = fs::symlink_metadata(&*realpath).await?;

        Ok(FCall::RStat {
            stat: stat_from_attr(&self.name_of(&realpath), &attr),
        })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> Result<FCall> {
        let unchanged = Stat::unchanged();
        let filepath = {
            let realpath = fid.aux.realpath.read().await;
            realpath.clone()
        };
        let attr = fs::symlink_metadata(&filepath).await?;

        if !stat.uid.is_empty() && stat.uid != user_name(attr.uid()) {
            return Err(errstr::EPERM.into());
        }

        if stat.length != unchanged.length {
            if attr.is_dir() {
                return Err(errstr::EISDIR.into());
            }
            fs::OpenOptions::new()
                .write(true)
                .create(false)
                .open(&filepath)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.mode != unchanged.mode {
            fs::set_permissions(&filepath, PermissionsExt::from_mode(stat.mode & 0o777)).await?;
        }

        if !stat.gid.is_empty() && stat.gid != group_name(attr.gid()) {
            let group = nix::unistd::Group::from_name(&stat.gid)?
                .ok_or_else(|| Error::from(errstr::EPERM))?;
            nix::unistd::chown(&filepath, None, Some(group.gid))?;
        }

        if stat.atime != unchanged.atime || stat.mtime != unchanged.mtime {
            let atime = if stat.atime != unchanged.atime {
                FileTime::from_unix_time(stat.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };

            let mtime = if stat.mtime != unchanged.mtime {
                FileTime::from_unix_time(stat.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };

            let path = filepath.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(path, atime, mtime))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        }

        if !stat.name.is_empty() && stat.name != self.name_of(&filepath) {
            if !is_plain_name(&stat.name) || filepath == self.realroot {
                return Err(errstr::EPERM.into());
            }
            let newpath = filepath.with_file_name(&stat.name);
            if fs::try_exists(&newpath).await? {
                return Err(errstr::EEXIST.into());
            }
            fs::rename(&filepath, &newpath).await?;

            let mut realpath = fid.aux.realpath.write().await;
            *realpath = newpath;
        }

        Ok(FCall::RWStat)
    }
}

async fn remove(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path).await? {
        ref attr if attr.is_dir() => fs::remove_dir(path).await?,
        _ => fs::remove_file(path).await?,
    };
    Ok(())
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Maximum directory depth to traverse
    #[arg(long, default_value_t = 200)]
    max_depth: usize,

    /// Largest 9P message to accept
    #[arg(long, default_value_t = MSIZE)]
    msize: u32,

    /// Log every filesystem call and its result
    #[arg(long)]
    debug: bool,
}

async fn ufs_main(
    Cli {
        address,
        exportdir,
        max_depth,
        msize,
        debug,
    }: Cli,
) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }

    let ufs = Ufs {
        realroot: fs::canonicalize(&exportdir).await?,
        max_depth,
    };
    let options = ServerOptions {
        msize,
        ..Default::default()
    };

    info!("Maximum depth limit: {}", max_depth);
    info!("Ready to accept clients: {}", address);
    let served = if debug {
        srv_async_with(DebugFs::new(ufs), &address, options).await
    } else {
        srv_async_with(ufs, &address, options).await
    };

    served.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ufs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ninep::serialize::Decodable;
    use std::io::Cursor;
    use tokio::io::duplex;

    struct Scratch(PathBuf);

    impl Scratch {
        fn new(name: &str) -> Scratch {
            let dir = std::env::temp_dir().join(format!("ufs-{}-{}", name, std::process::id()));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();
            Scratch(dir.canonicalize().unwrap())
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn mount(root: &Path, max_depth: usize) -> Client {
        let (ours, theirs) = duplex(1 << 16);
        let (r, w) = tokio::io::split(theirs);
        let ufs = Ufs {
            realroot: root.to_owned(),
            max_depth,
        };
        tokio::spawn(srv::dispatch(ufs, r, w));

        let (r, w) = tokio::io::split(ours);
        let client = Client::new(r, w);
        client.tversion(8192, P92000).await.unwrap();
        client.tattach(0, NOFID, "glenda", "").await.unwrap();
        client
    }

    fn names_in(mut data: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        while !data.is_empty() {
            let mut cursor = Cursor::new(data);
            let stat: Stat = Decodable::decode(&mut cursor).unwrap();
            names.push(stat.name);
            data = &data[cursor.position() as usize..];
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn create_write_read_stat() {
        let scratch = Scratch::new("rw");
        let client = mount(&scratch.0, 200).await;

        client.twalk::<&str>(0, 1, &[]).await.unwrap();
        let (qid, _) = client.tcreate(1, "hello", 0o644, om::RDWR).await.unwrap();
        assert!(!qid.typ.contains(QIdType::DIR));
        assert_eq!(client.twrite(1, 0, b"hello world").await.unwrap(), 11);
        assert_eq!(client.tread(1, 6, 100).await.unwrap(), b"world".to_vec());
        client.tclunk(1).await.unwrap();

        assert_eq!(client.twalk(0, 2, &["hello"]).await.unwrap().len(), 1);
        let stat = client.tstat(2).await.unwrap();
        assert_eq!(stat.name, "hello");
        assert_eq!(stat.length, 11);

        assert_eq!(std::fs::read(scratch.0.join("hello")).unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn wstat_truncates_and_renames() {
        let scratch = Scratch::new("wstat");
        std::fs::write(scratch.0.join("old"), b"0123456789").unwrap();
        let client = mount(&scratch.0, 200).await;

        client.twalk(0, 1, &["old"]).await.unwrap();
        let mut stat = Stat::unchanged();
        stat.name = "new".to_owned();
        stat.length = 4;
        stat.mtime = 1445968327;
        client.twstat(1, stat).await.unwrap();

        assert!(!scratch.0.join("old").exists());
        assert_eq!(std::fs::read(scratch.0.join("new")).unwrap(), b"0123".to_vec());
        let stat = client.tstat(1).await.unwrap();
        assert_eq!((stat.name.as_str(), stat.mtime), ("new", 1445968327));
    }

    #[tokio::test]
    async fn reads_of_msize_bytes_fit_in_one_message() {
        let scratch = Scratch::new("bigread");
        let content: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        std::fs::write(scratch.0.join("big"), &content).unwrap();

        let (ours, theirs) = duplex(1 << 16);
        let (r, w) = tokio::io::split(theirs);
        let ufs = Ufs {
            realroot: scratch.0.clone(),
            max_depth: 200,
        };
        let options = ServerOptions {
            msize: 8192,
            ..Default::default()
        };
        tokio::spawn(srv::dispatch_with(ufs, r, w, options));

        let (r, w) = tokio::io::split(ours);
        let options = ClientOptions {
            msize: 8192,
            ..Default::default()
        };
        let client = Client::with_options(r, w, options);
        let (msize, _) = client.tversion(8192, P92000).await.unwrap();
        client.tattach(0, NOFID, "glenda", "").await.unwrap();
        client.twalk(0, 1, &["big"]).await.unwrap();
        client.topen(1, om::READ).await.unwrap();

        let iounit = (msize - IOHDRSZ) as usize;
        let data = client.tread(1, 0, msize).await.unwrap();
        assert_eq!(data, content[..iounit].to_vec());
        let data = client.tread(1, iounit as u64, msize).await.unwrap();
        assert_eq!(data, content[iounit..2 * iounit].to_vec());
        assert!(!client.is_dead());
    }

    #[tokio::test]
    async fn directory_reads_return_whole_stats() {
        let scratch = Scratch::new("dir");
        for name in ["a", "b", "c"] {
            std::fs::write(scratch.0.join(name), name).unwrap();
        }
        let client = mount(&scratch.0, 200).await;

        client.twalk::<&str>(0, 1, &[]).await.unwrap();
        client.topen(1, om::READ).await.unwrap();
        let data = client.tread(1, 0, 8192).await.unwrap();
        assert_eq!(names_in(&data), vec!["a", "b", "c"]);
        let rest = client.tread(1, data.len() as u64, 8192).await.unwrap();
        assert!(rest.is_empty());

        assert!(client.tread(1, 3, 8192).await.is_err());
        assert!(client.twrite(1, 0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn walks_stay_inside_the_export() {
        let scratch = Scratch::new("walk");
        let client = mount(&scratch.0, 1).await;
        let root = client.twalk::<&str>(0, 1, &[]).await.unwrap();
        assert!(root.is_empty());

        let up = client.twalk(0, 2, &[".."]).await.unwrap();
        let stat = client.tstat(2).await.unwrap();
        assert_eq!(up[0], stat.qid);
        assert_eq!(stat.name, "/");

        assert!(client.twalk(0, 3, &["missing"]).await.is_err());

        client.tcreate(1, "a", dm::DIR | 0o755, om::READ).await.unwrap();
        // "a" is within the limit; "a/b" would be deeper than 1
        match client.twalk(0, 4, &["a", "b"]).await {
            Err(Error::Str(e)) => assert_eq!(e, Error::No(errno::ELOOP).ename()),
            other => panic!("expected ELOOP, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remove_and_remove_on_close() {
        let scratch = Scratch::new("remove");
        std::fs::write(scratch.0.join("gone"), b"x").unwrap();
        std::fs::write(scratch.0.join("temp"), b"x").unwrap();
        let client = mount(&scratch.0, 200).await;

        client.twalk(0, 1, &["gone"]).await.unwrap();
        client.tremove(1).await.unwrap();
        assert!(!scratch.0.join("gone").exists());
        assert!(client.tstat(1).await.is_err());

        client.twalk(0, 2, &["temp"]).await.unwrap();
        client.topen(2, om::READ | om::RCLOSE).await.unwrap();
        assert!(scratch.0.join("temp").exists());
        client.tclunk(2).await.unwrap();
        assert!(!scratch.0.join("temp").exists());

        client.twalk::<&str>(0, 3, &[]).await.unwrap();
        assert!(client.tremove(3).await.is_err());
        assert!(scratch.0.exists());
    }
}
