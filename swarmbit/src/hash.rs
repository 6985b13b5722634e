use serde::{Deserialize, Serialize};

pub const SHA1_LENGTH: usize = 20;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha1(pub(crate) [u8; SHA1_LENGTH]);

impl Sha1 {
    pub fn new(bytes: [u8; SHA1_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn hash(buf: &[u8]) -> Sha1 {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::default();
        hasher.update(buf);
        Sha1(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; SHA1_LENGTH]> for Sha1 {
    fn from(bytes: [u8; SHA1_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha1({self})")
    }
}

impl std::fmt::Display for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for v in self.0 {
            write!(f, "{:02x}", v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_digest() {
        let hash = Sha1::hash(b"abc");
        assert_eq!(hash.to_string(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn display_pads_bytes() {
        let mut bytes = [0u8; SHA1_LENGTH];
        bytes[0] = 0x0f;
        let hash = Sha1::new(bytes);
        assert!(hash.to_string().starts_with("0f00"));
        assert_eq!(hash.to_string().len(), 40);
    }
}
