//! Scan HTTP payloads in legacy pcap captures, mask body bytes while keeping
//! protocol structure, and verify that nothing outside the masks changed.

pub mod boundary;
pub mod chunked;
pub mod config;
pub mod content_length;
pub mod engine;
pub mod error;
pub mod mask;
pub mod packet;
pub mod pcap_io;
pub mod recipe;
pub mod scanner;
pub mod verify;

pub use boundary::{detect_header_boundary, detect_multiple_message_boundaries, BoundaryDetectionResult, BoundaryPattern};
pub use chunked::{analyze_chunked_structure, ChunkInfo, ChunkedAnalysisResult};
pub use config::{BoundaryWeights, ScanConfig};
pub use content_length::{parse_content_length, ContentLengthResult, EncodingType};
pub use engine::{MaskingEngine, MaskingStatistics, PacketOutcome};
pub use error::{ConfigError, EngineError, MaskSpecError, RecipeError, ScanError};
pub use mask::{ByteRange, MaskRanges, MaskSpec};
pub use recipe::{MaskingRecipe, PacketInstruction};
pub use scanner::{HttpScanner, MessageType, PassthroughScanner, PayloadScanner, ScanResult, ScannerRegistry};
pub use verify::{ConsistencyVerifier, VerificationReport};
