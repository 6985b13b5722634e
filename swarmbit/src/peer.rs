use rand::Rng as _;

pub const PEER_ID_LENGTH: usize = 20;

/// Client prefix in the Azureus style, `-SB0100-` is swarmbit 0.1.0.
const PEER_ID_PREFIX: &[u8; 8] = b"-SB0100-";

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    pub fn new(id: [u8; PEER_ID_LENGTH]) -> Self {
        Self(id)
    }

    /// Generate a random id with the client prefix and alphanumeric tail.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut id = [0u8; PEER_ID_LENGTH];
        id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
        for byte in id[PEER_ID_PREFIX.len()..].iter_mut() {
            *byte = rng.sample(rand::distributions::Alphanumeric);
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PEER_ID_LENGTH]> for PeerId {
    fn from(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PeerId(")?;
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        f.write_str(")")?;
        Ok(())
    }
}

// printable bytes as-is, everything else escaped
impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &v in self.0.iter() {
            if v.is_ascii_graphic() {
                write!(f, "{}", v as char)?;
            } else {
                write!(f, "\\x{:02x}", v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_ids_have_prefix() {
        let id = PeerId::generate();
        assert!(id.as_bytes().starts_with(PEER_ID_PREFIX));
        assert!(id.as_bytes().iter().all(|b| b.is_ascii_graphic()));
        assert_ne!(id, PeerId::generate());
    }

    #[test]
    fn display_escapes_binary() {
        let mut bytes = [b'a'; PEER_ID_LENGTH];
        bytes[0] = 0;
        let id = PeerId::new(bytes);
        assert!(id.to_string().starts_with("\\x00aaa"));
    }
}
