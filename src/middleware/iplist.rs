use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use http::{Method, StatusCode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, HandlerFunc, Middleware, handler_fn};

/// An address block such as `10.0.0.0/8` or `2001:db8::/32`. A bare address
/// is a full-length block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    /// Parses `ip` and tests it; unparseable input never matches.
    pub fn contains_str(&self, ip: &str) -> bool {
        ip.trim().parse().is_ok_and(|ip| self.contains(ip))
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        let bad = || Error::Config(format!("invalid address block `{s}`"));
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| bad())?;
        let addr = addr.to_canonical();
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max).ok_or_else(bad)?,
            None => max,
        };
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Lists {
    #[serde(default)]
    black: Vec<String>,
    #[serde(default)]
    white: Vec<String>,
}

/// Black and white lists matched against the client IP.
///
/// A client in the black list is refused. When the white list is non-empty
/// only clients in it are let through.
#[derive(Default)]
pub struct IpList {
    black: RwLock<Vec<Cidr>>,
    white: RwLock<Vec<Cidr>>,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, cidr: &str) -> Result<&Self, Error> {
        self.black.write().push(cidr.parse()?);
        Ok(self)
    }

    pub fn allow(&self, cidr: &str) -> Result<&Self, Error> {
        self.white.write().push(cidr.parse()?);
        Ok(self)
    }

    /// Removes `cidr` from both lists.
    pub fn remove(&self, cidr: &str) -> Result<(), Error> {
        let cidr: Cidr = cidr.parse()?;
        self.black.write().retain(|c| *c != cidr);
        self.white.write().retain(|c| *c != cidr);
        Ok(())
    }

    /// Replaces both lists; nothing changes if any entry is invalid.
    pub fn replace(&self, black: &[String], white: &[String]) -> Result<(), Error> {
        let black = black.iter().map(|s| s.parse()).collect::<Result<Vec<Cidr>, _>>()?;
        let white = white.iter().map(|s| s.parse()).collect::<Result<Vec<Cidr>, _>>()?;
        *self.black.write() = black;
        *self.white.write() = white;
        Ok(())
    }

    pub fn permits(&self, ip: &str) -> bool {
        let Ok(ip) = ip.trim().parse::<IpAddr>() else {
            return self.white.read().is_empty();
        };
        if self.black.read().iter().any(|c| c.contains(ip)) {
            return false;
        }
        let white = self.white.read();
        white.is_empty() || white.iter().any(|c| c.contains(ip))
    }

    fn lists(&self) -> Lists {
        Lists {
            black: self.black.read().iter().map(ToString::to_string).collect(),
            white: self.white.read().iter().map(ToString::to_string).collect(),
        }
    }

    /// `GET` returns both lists as JSON, `PUT` replaces them from a body of
    /// the same shape.
    pub fn admin(self: &Arc<Self>) -> HandlerFunc {
        let list = Arc::clone(self);
        handler_fn(move |ctx: &mut Context| {
            let list = Arc::clone(&list);
            Box::pin(async move {
                if *ctx.method() == Method::PUT {
                    let lists: Lists = match ctx.bind().await {
                        Ok(lists) => lists,
                        Err(e) => return ctx.fatal(e),
                    };
                    if let Err(e) = list.replace(&lists.black, &lists.white) {
                        return ctx.fatal(Error::Bind(e.to_string()));
                    }
                    ctx.write_header(StatusCode::NO_CONTENT);
                    return;
                }
                ctx.render(&list.lists());
            })
        })
    }
}

impl Middleware for IpList {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let ip = ctx.real_ip();
            if self.permits(&ip) {
                ctx.next().await;
                return;
            }
            ctx.debug(format_args!("ip {ip} refused"));
            ctx.write_error(&Error::Forbidden(format!("address {ip} is not allowed")));
            ctx.end();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::middleware::testing::{run, run_request};

    #[test]
    fn cidr_membership() {
        let net: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains_str("10.1.2.3"));
        assert!(!net.contains_str("192.168.1.1"));
        assert!(net.contains_str("::ffff:10.9.9.9"));
        assert!(!net.contains_str("garbage"));

        let host: Cidr = "192.168.1.1".parse().unwrap();
        assert_eq!(host.to_string(), "192.168.1.1/32");
        let v6: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains_str("2001:db8::1"));
        assert!("0.0.0.0/0".parse::<Cidr>().unwrap().contains_str("8.8.8.8"));

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("nope/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn black_beats_white() {
        let list = IpList::new();
        list.allow("10.0.0.0/8").unwrap().block("10.0.0.5").unwrap();
        assert!(list.permits("10.0.0.4"));
        assert!(!list.permits("10.0.0.5"));
        assert!(!list.permits("172.16.0.1"));
        list.remove("10.0.0.0/8").unwrap();
        assert!(list.permits("172.16.0.1"));
    }

    #[tokio::test]
    async fn refused_clients_get_403() {
        let list = Arc::new(IpList::new());
        list.block("10.0.0.1").unwrap();
        let ok = handler_fn(|ctx: &mut Context| Box::pin(async move { ctx.write_string("ok") }));
        let resp = run("/", vec![crate::handler(Arc::clone(&list)), ok.clone()]).await;
        assert_eq!(resp.status, StatusCode::FORBIDDEN);

        let req = http::Request::get("/").header("x-real-ip", "10.0.0.2").body(Bytes::new()).unwrap();
        let resp = run_request(req, vec![crate::handler(list), ok]).await;
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_replaces_lists() {
        let list = Arc::new(IpList::new());
        let req = http::Request::put("/admin")
            .header("content-type", "application/json")
            .body(Bytes::from_static(br#"{"black":["1.2.3.0/24"]}"#))
            .unwrap();
        let resp = run_request(req, vec![list.admin()]).await;
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(!list.permits("1.2.3.4"));

        let resp = run("/admin", vec![list.admin()]).await;
        assert_eq!(&resp.body[..], br#"{"black":["1.2.3.0/24"],"white":[]}"#);
    }
}
