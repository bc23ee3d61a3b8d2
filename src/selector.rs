use crate::errors::OperationError;

// Server selector maps an item's key to the index of the shard that owns it.
// Indexes are fixed when the server list is built, so the same key always lands
// on the same shard for the lifetime of a client. Changing the number of shards
// moves almost every key; there is no ring to soften that.
pub trait ServerSelector {
    fn server_count(&self) -> usize;

    fn pick_server(&self, key: &str) -> Result<usize, OperationError> {
        pick_shard(key, self.server_count())
    }
}

pub fn pick_shard(key: &str, servers: usize) -> Result<usize, OperationError> {
    match servers {
        0 => Err(OperationError::NoServersError),
        1 => Ok(0),
        _ => {
            let checksum = crc32fast::hash(key.as_bytes());
            Ok((checksum % servers as u32) as usize)
        }
    }
}
