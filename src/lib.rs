pub mod cache;
pub mod crypto;
pub mod decode;
pub mod store;
pub mod types;

pub use cache::{CacheError, FileBuilder, FileSearcher, MemoryCache, PackLocation};
pub use crypto::{decrypt_object, object_reader, CryptoError, Keyring, ObjectReader, PaddedReader};
pub use decode::{ArqDecode, DecodeError, LenTag, TeeReader, TimeSpec};
pub use types::{
    decode_pack, decode_pack_index, decode_tree, BlobKey, CompressionType, Node, Pack, PackIndex,
    PackIndexObject, PackObject, ShaHash, Tree, TreeNode,
};
