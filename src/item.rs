#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    /// Opaque to the server; interpreted only by the application.
    pub flags: u32,
    /// Seconds: relative up to 30 days, otherwise an absolute Unix time.
    /// Zero means the item never expires.
    pub expiration: i32,
    // Set only from a server response.
    cas_id: u64,
}

impl Item {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        flags: u32,
        expiration: i32,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags,
            expiration,
            cas_id: 0,
        }
    }

    pub(crate) fn fetched(key: String, value: Vec<u8>, flags: u32, cas_id: u64) -> Self {
        Self {
            key,
            value,
            flags,
            expiration: 0,
            cas_id,
        }
    }

    /// Version stamp from the last fetch or write of this item, echoed back
    /// by `compare_and_swap`.
    pub fn cas_id(&self) -> u64 {
        self.cas_id
    }

    pub(crate) fn set_cas_id(&mut self, cas_id: u64) {
        self.cas_id = cas_id;
    }
}
