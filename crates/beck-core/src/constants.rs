//! Protocol and storage constants.

/// Maximum size of a single `blkNNNNN.dat` file. Once the current file
/// cannot fit the next block plus framing, the writer rolls over to a new
/// file. Undo (`rev`) files are allowed to exceed this.
pub const MAX_BLOCKFILE_SIZE: u32 = 0x0800_0000; // 128 MiB

/// Increment by which block data files grow.
pub const BLOCKFILE_CHUNK_SIZE: u32 = 0x0100_0000; // 16 MiB

/// Increment by which undo data files grow.
pub const UNDOFILE_CHUNK_SIZE: u32 = 0x0010_0000; // 1 MiB

/// Smallest framed record the file scanner will accept; anything shorter
/// than one serialized block header is noise.
pub const MIN_BLOCK_SIZE: u32 = 80;

/// Network type: Mainnet, Testnet, FlexTestnet, or Regtest.
///
/// Controls the on-disk record magic, the data directory suffix, and the
/// default RPC port.
///
/// # Examples
///
/// ```
/// use beck_core::constants::Network;
/// let net = Network::default();
/// assert_eq!(net, Network::Mainnet);
/// assert_eq!(net.magic_bytes(), *b"BECK");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Flexible-transaction test network.
    FlexTestnet,
    /// Local regression-test network.
    Regtest,
}

impl Network {
    /// Four-byte sentinel framing every record in the block data files.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0x42, 0x45, 0x43, 0x4B],     // "BECK"
            Self::Testnet => [0x54, 0x42, 0x43, 0x4B],     // "TBCK"
            Self::FlexTestnet => [0x46, 0x42, 0x43, 0x4B], // "FBCK"
            Self::Regtest => [0x52, 0x42, 0x43, 0x4B],     // "RBCK"
        }
    }

    /// Canonical chain selection name as used on command lines and in
    /// configuration files.
    pub fn chain_name(&self) -> &'static str {
        match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
            Self::FlexTestnet => "fttest",
            Self::Regtest => "regtest",
        }
    }

    /// Parse a chain selection name. Returns `None` for unknown chains.
    pub fn from_chain_name(name: &str) -> Option<Self> {
        match name {
            "main" => Some(Self::Mainnet),
            "test" => Some(Self::Testnet),
            "fttest" => Some(Self::FlexTestnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    /// Subdirectory name appended to the base data directory path.
    /// Mainnet uses the base directory itself.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "",
            Self::Testnet => "testnet",
            Self::FlexTestnet => "testnet-flex",
            Self::Regtest => "regtest",
        }
    }

    /// Default TCP port for the JSON-RPC server.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8332,
            Self::Testnet => 18332,
            Self::FlexTestnet => 18334,
            Self::Regtest => 18443,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_distinct_per_network() {
        let all = [
            Network::Mainnet,
            Network::Testnet,
            Network::FlexTestnet,
            Network::Regtest,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.magic_bytes(), b.magic_bytes());
            }
        }
    }

    #[test]
    fn chain_name_round_trip() {
        for net in [
            Network::Mainnet,
            Network::Testnet,
            Network::FlexTestnet,
            Network::Regtest,
        ] {
            assert_eq!(Network::from_chain_name(net.chain_name()), Some(net));
        }
        assert_eq!(Network::from_chain_name("bogus"), None);
    }

    #[test]
    fn default_is_mainnet() {
        assert_eq!(Network::default(), Network::Mainnet);
    }

    #[test]
    fn chunk_sizes_divide_max_file_size() {
        assert_eq!(MAX_BLOCKFILE_SIZE % BLOCKFILE_CHUNK_SIZE, 0);
        assert_eq!(MAX_BLOCKFILE_SIZE % UNDOFILE_CHUNK_SIZE, 0);
    }
}
