use tracing::debug;

use crate::error::{ConfigError, DbError, Result};
use crate::session::Session;
use crate::{params, sql};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(pub i32);

impl ServerVersion {
    /// `server_version_num` style: 90200 is 9.2, 160003 is 16.3.
    pub fn from_num(num: i32) -> Self {
        ServerVersion(num)
    }

    pub fn major(&self) -> i32 {
        self.0 / 10000
    }

    pub fn minor(&self) -> i32 {
        if self.0 >= 100000 {
            self.0 % 10000
        } else {
            (self.0 / 100) % 100
        }
    }

    /// Snapshot query for this server, or `None` when it is too old.
    pub fn xid_snapshot_query(&self) -> Option<&'static str> {
        if self.0 >= 90200 {
            Some(sql::XID_SNAPSHOT_90200)
        } else if self.0 >= 90000 {
            Some(sql::XID_SNAPSHOT_90000)
        } else {
            None
        }
    }
}

pub fn detect_server_version(session: &mut Session) -> Result<ServerVersion> {
    let value = session
        .query_value(sql::SERVER_VERSION, params![])?
        .ok_or_else(|| DbError::new(sql::SERVER_VERSION, None, "no server version returned"))?;
    let num: i32 = value
        .trim()
        .parse()
        .map_err(|_| DbError::new(sql::SERVER_VERSION, None, format!("bad server version {value}")))?;
    let version = ServerVersion::from_num(num);
    if version.xid_snapshot_query().is_none() {
        return Err(ConfigError::UnsupportedServer(num).into());
    }
    debug!("server version {}.{}", version.major(), version.minor());
    Ok(version)
}

/// The version string the support schema must report for this program.
pub fn program_version() -> String {
    format!("{} {}", sql::APPLICATION_NAME, env!("CARGO_PKG_VERSION"))
}
