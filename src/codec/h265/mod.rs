//! H.265/HEVC-style residual coding core
//!
//! Transform, quantization and entropy coding of prediction residuals for a
//! hybrid block video codec, plus the symmetric parsing and reconstruction
//! path. Extended (JEM-style) tools are runtime options of
//! [`CodingTools`]: 67 intra modes, explicit multiple transforms (EMT),
//! affine and OBMC flags, and adaptive loop filter parameter syntax.
//!
//! ## Architecture
//!
//! ```text
//! Residual block
//!     ↓
//! TransformEngine ───→ DCT-II / DST-VII / EMT kernels, transform skip
//!     ↓
//! Quantizer ─────────→ scalar + sign hiding, or RDOQ (RdCostState λ)
//!     ↓
//! TransformTree ─────→ split flags, CBFs, cu_qp_delta, EMT indices
//!     ↓
//! EntropyEncoder ────→ CU / PU / TU syntax in document order
//!     ↓
//! Sbac<CabacWriter> ─→ context modeling + arithmetic coding
//!     ↓
//! Slice data bytes
//! ```
//!
//! Decoding runs the same chain upwards with [`EntropyDecoder`],
//! [`Sbac`]`<`[`CabacReader`]`>` and [`Reconstructor`]. Rate estimation uses
//! [`Sbac`]`<`[`BinCounter`]`>` on a copy of the live contexts.
//!
//! ## Usage Example
//!
//! ```rust
//! use zvd_tq::codec::h265::{
//!     CabacReader, CabacWriter, CodecConfig, CodingUnit, CuNeighbors, EntropyDecoder,
//!     EntropyEncoder, Sbac, SliceParams, SliceType, TransformTree,
//! };
//!
//! let config = CodecConfig::hevc_main();
//! let slice = SliceParams::new(SliceType::I, 32);
//!
//! let cu = CodingUnit::new(0, 0, 4, 0);
//! let mut tree = TransformTree::new(&cu, config.chroma_format);
//! let mut levels = vec![0; 256];
//! levels[0] = 3;
//! tree.set_luma(tree.root(), levels)?;
//! tree.update_cbfs();
//!
//! let mut sbac = Sbac::new(CabacWriter::new(), slice.slice_type, slice.qp);
//! let mut enc = EntropyEncoder::new(&mut sbac, &config, slice);
//! enc.encode_coding_unit(&cu, &CuNeighbors::default(), Some(&tree), 32)?;
//! enc.encode_end_of_slice_segment_flag(true);
//! let data = sbac.into_inner().finish();
//!
//! let mut sbac = Sbac::new(CabacReader::new(&data)?, slice.slice_type, slice.qp);
//! let mut dec = EntropyDecoder::new(&mut sbac, &config, slice);
//! let (decoded, decoded_tree) = dec.decode_coding_unit(0, 0, 4, 0, &CuNeighbors::default(), 32)?;
//! assert_eq!(decoded.intra_luma_modes[0], cu.intra_luma_modes[0]);
//! assert!(decoded_tree.is_some());
//! # Ok::<(), zvd_tq::error::Error>(())
//! ```

pub mod alf;
pub mod bitstream;
pub mod cabac;
pub mod config;
pub mod contexts;
pub mod ctu;
pub mod encoder_transform;
pub mod entropy;
pub mod quant;
pub mod rdo;
pub mod recon;
pub mod residual;
pub mod sbac;
pub mod scan;
pub mod transform;
pub mod tu;

pub use alf::{AlfFilterSet, AlfParams, AlfShape, AlfStore};
pub use cabac::{BinCounter, BinDecoder, BinEncoder, CabacReader, CabacWriter, ContextModel};
pub use config::{ChromaFormat, CodecConfig, CodingTools, SliceType};
pub use contexts::ContextSet;
pub use ctu::{CodingUnit, CuNeighbors, InterDir, Mv, NeighborCu, PartMode, PredMode, PredictionUnit};
pub use encoder_transform::{BlockSite, TransformChoice, TransformDecision, TransformResult};
pub use entropy::{EntropyDecoder, EntropyEncoder, SliceParams};
pub use quant::{QpParam, QuantBlock, Quantizer};
pub use rdo::{CostFunction, DistFunc, DistParam, RdCost, RdCostState};
pub use recon::{Reconstructor, ResidualBlock};
pub use sbac::{Sbac, SymbolDecoder, SymbolEncoder};
pub use scan::ScanPattern;
pub use transform::{KernelPair, TransformEngine, TransformKernel, TransformSize};
pub use tu::{TransformTree, TuId, TuNode};
