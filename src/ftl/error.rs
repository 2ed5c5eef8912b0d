use thiserror::Error;

/// Everything that can go wrong while mounting or accessing a NAND disk
#[derive(Error, Debug)]
pub enum FtlError {
    #[error("Out of memory allocating translation tables")]
    OutOfMemory,
    #[error("NAND I/O error")]
    Io(#[source] anyhow::Error),
    #[error("No free physical block left")]
    BlockPoolExhausted,
    #[error("NAND is not in a recognized format")]
    FormatError,
    #[error(
        "P2LN swap record (P2LN {swap_p2ln}, OP {swap_op}) does not match the loaded \
         checkpoint (P2LN {p2ln}, OP {op})"
    )]
    P2lnSync {
        swap_p2ln: u16,
        swap_op: u16,
        p2ln: u16,
        op: u16,
    },
    #[error("Unrecognized NAND flash")]
    UnknownId(#[source] anyhow::Error),
    #[error("Unsupported NAND geometry: {0}")]
    UnsupportedGeometry(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FtlError {
    /// The numeric NANDLIB status code for this error
    pub fn error_code(&self) -> u32 {
        const NANDLIB_ERR: u32 = 0xFFFF_C000;
        match self {
            FtlError::OutOfMemory => NANDLIB_ERR | 0x05,
            FtlError::FormatError => NANDLIB_ERR | 0x10,
            FtlError::BlockPoolExhausted => NANDLIB_ERR | 0x20,
            FtlError::P2lnSync { .. } => NANDLIB_ERR | 0x25,
            FtlError::Io(_) | FtlError::InvalidRequest(_) => NANDLIB_ERR | 0x30,
            FtlError::UnknownId(_) | FtlError::UnsupportedGeometry(_) => NANDLIB_ERR | 0x42,
        }
    }
}

pub type Result<T, E = FtlError> = std::result::Result<T, E>;

#[test]
fn test_error_codes() {
    assert_eq!(FtlError::OutOfMemory.error_code(), 0xFFFF_C005);
    assert_eq!(FtlError::BlockPoolExhausted.error_code(), 0xFFFF_C020);
    assert_eq!(
        FtlError::Io(anyhow::anyhow!("timeout")).error_code(),
        0xFFFF_C030
    );
}
