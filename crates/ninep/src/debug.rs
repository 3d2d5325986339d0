//! A `Filesystem` decorator that logs every call and its outcome.

use {
    crate::{
        fcall::*,
        srv::{FId, Filesystem},
        utils::Result,
    },
    async_trait::async_trait,
    log::info,
};

/// Wraps a backend, logging `>>> T...` before and `<<< R...` after each operation.
#[derive(Clone, Debug, Default)]
pub struct DebugFs<Fs> {
    inner: Fs,
}

impl<Fs> DebugFs<Fs> {
    pub fn new(inner: Fs) -> DebugFs<Fs> {
        DebugFs { inner }
    }

    pub fn into_inner(self) -> Fs {
        self.inner
    }
}

fn report(res: Result<FCall>) -> Result<FCall> {
    match res {
        Ok(ref fcall) => info!("<<< {:?}", fcall),
        Err(ref e) => info!("<<< Error {}", e),
    }
    res
}

#[async_trait]
impl<Fs> Filesystem for DebugFs<Fs>
where
    Fs: Filesystem + Sync,
{
    type FId = Fs::FId;

    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        info!(">>> Tversion {} {}", msize, ver);
        report(self.inner.rversion(msize, ver).await)
    }

    async fn rauth(&self, afid: &FId<Self::FId>, uname: &str, aname: &str) -> Result<FCall> {
        info!(">>> Tauth afid {}, uname {}, aname {}", afid.fid(), uname, aname);
        report(self.inner.rauth(afid, uname, aname).await)
    }

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        afid: Option<&FId<Self::FId>>,
        uname: &str,
        aname: &str,
    ) -> Result<FCall> {
        info!(
            ">>> Tattach fid {}, afid {:?}, uname {}, aname {}",
            fid.fid(),
            afid.map(FId::fid),
            uname,
            aname
        );
        report(self.inner.rattach(fid, afid, uname, aname).await)
    }

    async fn rflush(&self, old: Option<&FCall>) -> Result<FCall> {
        info!(">>> Tflush {:?}", old);
        report(self.inner.rflush(old).await)
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        new: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        info!(">>> Twalk fid {}, newfid {}, paths {:?}", fid.fid(), new.fid(), wnames);
        report(self.inner.rwalk(fid, new, wnames).await)
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        info!(">>> Topen fid {}, mode {}", fid.fid(), mode);
        report(self.inner.ropen(fid, mode).await)
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<FCall> {
        info!(">>> Tcreate fid {}, name {}, perm {:#o}, mode {}", fid.fid(), name, perm, mode);
        report(self.inner.rcreate(fid, name, perm, mode).await)
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        info!(">>> Tread fid {}, off {}, count {}", fid.fid(), offset, count);
        let res = self.inner.rread(fid, offset, count).await;
        // Log the length rather than the data itself.
        match res {
            Ok(FCall::RRead { ref data }) => info!("<<< Rread {}", data.0.len()),
            Ok(ref fcall) => info!("<<< {:?}", fcall),
            Err(ref e) => info!("<<< Error {}", e),
        }
        res
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        info!(">>> Twrite fid {}, off {}, count {}", fid.fid(), offset, data.0.len());
        report(self.inner.rwrite(fid, offset, data).await)
    }

    async fn rclunk(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        info!(">>> Tclunk fid {}", fid.fid());
        report(self.inner.rclunk(fid).await)
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        info!(">>> Tremove fid {}", fid.fid());
        report(self.inner.rremove(fid).await)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        info!(">>> Tstat fid {}", fid.fid());
        report(self.inner.rstat(fid).await)
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> Result<FCall> {
        info!(">>> Twstat fid {}, {:?}", fid.fid(), stat);
        report(self.inner.rwstat(fid, stat).await)
    }
}
