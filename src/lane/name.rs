use std::fmt;
use std::str::FromStr;

use htunnel_core::PeerId;

use crate::error::Error;

/// Name of a lane and label of its data channel.
///
/// The initiating peer prefixes a local serial with its own peer id,
/// `"<peer>|<serial>"`, so names chosen by two peers never collide. Without a
/// known peer id the bare serial is used.
///
/// ```rust
/// use htunnel::lane::ChannelName;
/// use htunnel_core::PeerId;
///
/// let name = ChannelName::new(Some(PeerId::new(7)), 3);
/// assert_eq!(name.to_string(), "7|3");
/// assert_eq!("7|3".parse::<ChannelName>().unwrap(), name);
/// assert_eq!("3".parse::<ChannelName>().unwrap().serial(), 3);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelName {
    owner: Option<PeerId>,
    serial: u64,
}

impl ChannelName {
    pub fn new(owner: Option<PeerId>, serial: u64) -> Self {
        Self { owner, serial }
    }
    pub fn local(owner: PeerId, serial: u64) -> Self {
        if owner.is_unspecified() {
            Self::new(None, serial)
        } else {
            Self::new(Some(owner), serial)
        }
    }
    pub fn owner(&self) -> Option<PeerId> {
        self.owner
    }
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "{}|{}", owner, self.serial),
            None => write!(f, "{}", self.serial),
        }
    }
}

impl FromStr for ChannelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidChannelName(s.to_string());
        let digits = |v: &str| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit());
        match s.split_once('|') {
            Some((owner, serial)) => {
                if !digits(owner) || !digits(serial) {
                    return Err(invalid());
                }
                let owner = owner.parse::<PeerId>().map_err(|_| invalid())?;
                let serial = serial.parse::<u64>().map_err(|_| invalid())?;
                Ok(Self::new(Some(owner), serial))
            }
            None => {
                if !digits(s) {
                    return Err(invalid());
                }
                let serial = s.parse::<u64>().map_err(|_| invalid())?;
                Ok(Self::new(None, serial))
            }
        }
    }
}
