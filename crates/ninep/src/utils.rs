use crate::error;
use std::sync::Arc;

pub type Result<T> = ::std::result::Result<T, error::Error>;

/// Observability hook, called with one formatted line per message.
pub type Tracer = Arc<dyn Fn(&str) + Send + Sync>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split `proto!addr!port` into the protocol and a socket address.
///
/// For `unix`, the address is the socket path and the third field is a suffix
/// appended to it, e.g. `unix!/tmp/ninep!0` names `/tmp/ninep:0`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() {
        return None;
    }

    Some((proto, addr.to_owned() + ":" + port))
}

pub(crate) fn trace(tracer: &Option<Tracer>, line: impl FnOnce() -> String) {
    if let Some(t) = tracer {
        t(&line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parse_proto_splits_three_fields() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1:564".to_owned()))
        );
        assert_eq!(
            parse_proto("unix!/tmp/ninep!0"),
            Some(("unix", "/tmp/ninep:0".to_owned()))
        );
        assert_eq!(parse_proto("tcp!127.0.0.1"), None);
        assert_eq!(parse_proto("tcp!a!b!c"), None);
    }

    #[test]
    fn trace_is_lazy_without_tracer() {
        trace(&None, || panic!("formatted without a tracer"));

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let tracer: Option<Tracer> = Some(Arc::new(move |s: &str| {
            sink.lock().unwrap().push(s.to_owned())
        }));
        trace(&tracer, || "Tversion".to_owned());
        assert_eq!(*lines.lock().unwrap(), vec!["Tversion".to_owned()]);
    }
}
