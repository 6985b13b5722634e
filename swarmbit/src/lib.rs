mod hash;
pub use hash::Sha1;

mod peer;
pub use peer::{PeerId, PEER_ID_LENGTH};

mod piece;
pub use piece::{PieceBitfield, PieceIdx};

mod info;
pub use info::{InfoError, TorrentFile, TorrentInfo};

mod creator;
pub use creator::{TorrentCreator, TorrentCreatorConfig, TorrentCreatorFile};

pub mod wire;
pub use wire::{Handshake, Message, WireError};

mod tally;
pub use tally::{SwarmTally, TallyError, OWNED};

mod picker;
pub use picker::{
    BasicPiecePicker, PickOrder, PickerError, PieceBlock, PiecePicker, BLOCK_LENGTH,
};

mod choke;
pub use choke::{ChokePolicy, InterestedUnchoke};

mod store;
pub use store::{FileStorage, MemoryStorage, PieceStore, Storage, StoreError};

mod session;
pub use session::{PeerFlags, PeerKey, PeerSession, SendError, Torrent, TorrentConfig};

mod view;
pub use view::{TorrentView, TorrentViewPeer};

mod error;
pub use error::Error;
