use {
    ninep::{fcall::*, io_err, serialize::Encodable},
    nix::unistd::{Gid, Group, Uid, User},
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

#[macro_export]
macro_rules! INVALID_FID {
    () => {
        ninep::Error::from(ninep::errstr::ENOTOPEN)
    };
}

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<QId> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

/// The qid version follows the modification time, so it moves with every write.
pub fn qid_from_attr(attr: &Metadata) -> QId {
    QId {
        typ: From::from(attr.file_type()),
        version: attr.mtime() as u32 ^ attr.mtime_nsec() as u32,
        path: attr.ino(),
    }
}

pub fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

pub fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

pub fn stat_from_attr(name: &str, attr: &Metadata) -> Stat {
    let mut mode = attr.mode() & 0o777;
    if attr.is_dir() {
        mode |= dm::DIR;
    }

    Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_attr(attr),
        mode,
        atime: attr.atime() as u32,
        mtime: attr.mtime() as u32,
        length: if attr.is_dir() { 0 } else { attr.len() },
        name: name.to_owned(),
        uid: user_name(attr.uid()),
        gid: group_name(attr.gid()),
        muid: String::new(),
    }
}

/// Snapshot of a directory taken when it is read from offset 0.
///
/// Each entry is a complete encoded `Stat`; replies carry whole entries only.
#[derive(Debug, Default)]
pub struct DirListing {
    entries: Vec<Vec<u8>>,
    next: usize,
    /// Offset the next read must ask for
    pub offset: u64,
}

impl DirListing {
    pub async fn read<P: AsRef<Path> + ?Sized>(path: &P) -> ninep::Result<DirListing> {
        let mut entries = Vec::new();
        let mut stream = ReadDirStream::new(fs::read_dir(path.as_ref()).await?);
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            // Entries removed since the listing started are skipped.
            let Ok(attr) = fs::symlink_metadata(entry.path()).await else {
                continue;
            };
            let stat = stat_from_attr(&entry.file_name().to_string_lossy(), &attr);
            let mut buf = Vec::with_capacity(stat.size() + 2);
            stat.encode(&mut buf)?;
            entries.push(buf);
        }

        Ok(DirListing {
            entries,
            next: 0,
            offset: 0,
        })
    }

    /// Take as many whole entries as fit in `count` bytes.
    ///
    /// An empty result means the listing is exhausted.
    pub fn next_chunk(&mut self, count: u32) -> ninep::Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(entry) = self.entries.get(self.next) {
            if data.len() + entry.len() > count as usize {
                break;
            }
            data.extend_from_slice(entry);
            self.next += 1;
        }

        if data.is_empty() && self.next < self.entries.len() {
            return Err(io_err!(InvalidInput, "count too small for a directory entry").into());
        }

        self.offset += data.len() as u64;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(sizes: &[usize]) -> DirListing {
        DirListing {
            entries: sizes.iter().map(|n| vec![0xaa; *n]).collect(),
            next: 0,
            offset: 0,
        }
    }

    #[test]
    fn chunks_never_split_entries() {
        let mut dir = listing(&[40, 40, 40]);
        assert_eq!(dir.next_chunk(100).unwrap().len(), 80);
        assert_eq!(dir.offset, 80);
        assert_eq!(dir.next_chunk(100).unwrap().len(), 40);
        assert_eq!(dir.offset, 120);
        assert!(dir.next_chunk(100).unwrap().is_empty());
    }

    #[test]
    fn count_below_one_entry_is_an_error() {
        let mut dir = listing(&[40]);
        assert!(dir.next_chunk(39).is_err());
        assert_eq!(dir.offset, 0);
        assert_eq!(dir.next_chunk(40).unwrap().len(), 40);
    }

    #[test]
    fn qid_version_follows_mtime() {
        let path = std::env::temp_dir().join(format!("ufs-qid-{}", std::process::id()));
        std::fs::write(&path, b"one").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1445968327, 0)).unwrap();
        let before = qid_from_attr(&std::fs::metadata(&path).unwrap());

        std::fs::write(&path, b"two").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1445968328, 0)).unwrap();
        let after = qid_from_attr(&std::fs::metadata(&path).unwrap());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(before.path, after.path);
        assert_ne!(before.version, after.version);
    }

    #[test]
    fn directories_carry_dmdir() {
        let attr = std::fs::metadata(std::env::temp_dir()).unwrap();
        let stat = stat_from_attr("tmp", &attr);
        assert_ne!(stat.mode & dm::DIR, 0);
        assert!(stat.qid.typ.contains(QIdType::DIR));
        assert_eq!(stat.length, 0);
        assert_eq!(stat.name, "tmp");
    }
}
