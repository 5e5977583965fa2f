use bytemuck::{Pod, Zeroable};

/// "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;
/// Version written by this crate.
pub const GGUF_VERSION: u32 = 3;
/// Data alignment when `general.alignment` is absent.
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;

/// Fixed-size file header, laid out exactly as on disk (little-endian hosts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RawHeader {
    pub magic: u32,
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

impl RawHeader {
    pub const SIZE: usize = std::mem::size_of::<RawHeader>();

    pub fn new(tensor_count: u64, kv_count: u64) -> Self {
        Self {
            magic: GGUF_MAGIC,
            version: GGUF_VERSION,
            tensor_count,
            kv_count,
        }
    }
}
