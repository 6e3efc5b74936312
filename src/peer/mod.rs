mod message;

pub use message::WireMessage;

use rand::Rng;
use std::fmt;

/// 20-byte peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a random peer ID
    /// Format: -PW0001-<12 random chars>
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-PW0001-");

        let mut rng = rand::thread_rng();
        for byte in &mut peer_id[8..] {
            *byte = rng.gen_range(b'0'..=b'z');
        }

        Self(peer_id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell connections apart in logs
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

/// Identifies the file a connection transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We request pieces
    Download,
    /// We serve pieces
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Who a connection links, for which file, in which direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub local: PeerId,
    pub peer: PeerId,
    pub file: FileId,
    pub direction: Direction,
}

impl ConnectionIdentity {
    pub fn new(local: PeerId, peer: PeerId, file: FileId, direction: Direction) -> Self {
        Self {
            local,
            peer,
            file,
            direction,
        }
    }

    /// The same link seen from the other end
    #[cfg(test)]
    pub fn reversed(&self) -> Self {
        Self {
            local: self.peer,
            peer: self.local,
            file: self.file,
            direction: match self.direction {
                Direction::Download => Direction::Upload,
                Direction::Upload => Direction::Download,
            },
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {} ({})", self.file, self.local, self.peer, self.direction)
    }
}
