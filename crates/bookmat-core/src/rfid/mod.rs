//! RFID identification: frame codec, UID normalization, readers.

pub mod frame;
pub mod normalize;
pub mod reader;

pub use frame::{build_frame, crc16, parse_inventory, FrameError};
pub use normalize::{normalize_epc, normalize_uid, uid_variants, UHF_CARD_UID_LENGTH};
pub use reader::{
    BookReader, CardSource, MockTagFeed, MockTagPort, RfidError, TagPort, UnifiedCardReader,
    DEBOUNCE_MS, DEFAULT_POLL_INTERVAL,
};
