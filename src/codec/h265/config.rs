//! Sequence-level coding configuration
//!
//! Optional coding tools are runtime switches on [`CodingTools`] and are
//! checked at the point of use. A [`CodecConfig`] is validated once when a
//! session is created and then shared by reference with the transform,
//! quantization and entropy stages.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Chroma format
// ─────────────────────────────────────────────────────────────────────────────

/// Chroma sampling format (chroma_format_idc)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    /// Luma only
    Monochrome,
    /// 4:2:0
    Yuv420,
    /// 4:2:2
    Yuv422,
    /// 4:4:4
    Yuv444,
}

impl ChromaFormat {
    /// True when chroma planes are present
    pub fn has_chroma(&self) -> bool {
        !matches!(self, ChromaFormat::Monochrome)
    }

    /// Horizontal chroma subsampling shift
    pub fn shift_x(&self) -> u8 {
        match self {
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422 => 1,
            _ => 0,
        }
    }

    /// Vertical chroma subsampling shift
    pub fn shift_y(&self) -> u8 {
        match self {
            ChromaFormat::Yuv420 => 1,
            _ => 0,
        }
    }

    /// chroma_format_idc value
    pub fn idc(&self) -> u8 {
        match self {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::Yuv420 => 1,
            ChromaFormat::Yuv422 => 2,
            ChromaFormat::Yuv444 => 3,
        }
    }
}

impl Default for ChromaFormat {
    fn default() -> Self {
        ChromaFormat::Yuv420
    }
}

impl fmt::Display for ChromaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChromaFormat::Monochrome => "4:0:0",
            ChromaFormat::Yuv420 => "4:2:0",
            ChromaFormat::Yuv422 => "4:2:2",
            ChromaFormat::Yuv444 => "4:4:4",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<u8> for ChromaFormat {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChromaFormat::Monochrome),
            1 => Ok(ChromaFormat::Yuv420),
            2 => Ok(ChromaFormat::Yuv422),
            3 => Ok(ChromaFormat::Yuv444),
            _ => Err(Error::config(format!(
                "chroma_format_idc {} out of range 0..=3",
                value
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slice type
// ─────────────────────────────────────────────────────────────────────────────

/// Slice type, which selects the context initialization table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceType {
    /// Bi-predictive
    B,
    /// Predictive
    P,
    /// Intra only
    I,
}

impl SliceType {
    /// Row of the context initialization tables
    pub fn init_row(&self) -> usize {
        match self {
            SliceType::B => 0,
            SliceType::P => 1,
            SliceType::I => 2,
        }
    }

    /// True for I slices
    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SliceType::B => "B",
            SliceType::P => "P",
            SliceType::I => "I",
        };
        write!(f, "{}", name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coding tools
// ─────────────────────────────────────────────────────────────────────────────

/// Optional coding tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingTools {
    /// Sign data hiding per coefficient group
    pub sign_data_hiding: bool,
    /// cu_transquant_bypass_flag is coded
    pub transquant_bypass: bool,
    /// transform_skip_flag is coded for 4x4 blocks
    pub transform_skip: bool,
    /// Rate-distortion optimized quantization in the encoder
    pub rdoq: bool,
    /// Explicit multiple transforms for intra CUs
    pub emt_intra: bool,
    /// Explicit multiple transforms for inter CUs
    pub emt_inter: bool,
    /// Adaptive loop filter parameter syntax
    pub alf: bool,
    /// 67 intra luma modes with six most probable modes
    pub extended_intra_modes: bool,
    /// Affine motion flag
    pub affine: bool,
    /// Overlapped block motion compensation flag
    pub obmc: bool,
    /// Asymmetric motion partitions
    pub amp: bool,
    /// cu_qp_delta_abs / sign are coded
    pub cu_qp_delta: bool,
    /// Inverse transform skips all-zero trailing rows and columns
    pub skip_zero_rows: bool,
    /// Sequence-level lossless: RD cost is bits only
    pub sequence_lossless: bool,
}

impl Default for CodingTools {
    fn default() -> Self {
        Self {
            sign_data_hiding: true,
            transquant_bypass: false,
            transform_skip: true,
            rdoq: true,
            emt_intra: false,
            emt_inter: false,
            alf: false,
            extended_intra_modes: false,
            affine: false,
            obmc: false,
            amp: true,
            cu_qp_delta: false,
            skip_zero_rows: true,
            sequence_lossless: false,
        }
    }
}

impl CodingTools {
    /// Tool set of a JEM-style extended profile
    pub fn extended() -> Self {
        Self {
            emt_intra: true,
            emt_inter: true,
            alf: true,
            extended_intra_modes: true,
            affine: true,
            obmc: true,
            ..Self::default()
        }
    }

    /// Number of intra luma prediction modes
    pub fn num_intra_modes(&self) -> u8 {
        if self.extended_intra_modes {
            67
        } else {
            35
        }
    }

    /// Number of most probable modes
    pub fn num_mpm(&self) -> u8 {
        if self.extended_intra_modes {
            6
        } else {
            3
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Sequence and picture parameters consumed by the residual pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Luma bit depth (8, 10 or 12)
    pub bit_depth_luma: u8,
    /// Chroma bit depth (8, 10 or 12)
    pub bit_depth_chroma: u8,
    /// Chroma sampling format
    pub chroma_format: ChromaFormat,
    /// log2 of the CTB size
    pub log2_ctb_size: u8,
    /// log2 of the minimum coding block size
    pub log2_min_cb_size: u8,
    /// log2 of the minimum luma transform block size
    pub log2_min_tb_size: u8,
    /// log2 of the maximum luma transform block size
    pub log2_max_tb_size: u8,
    /// max_transform_hierarchy_depth_intra
    pub max_tu_depth_intra: u8,
    /// max_transform_hierarchy_depth_inter
    pub max_tu_depth_inter: u8,
    /// Merge candidate list size (1..=5)
    pub max_num_merge_cand: u8,
    /// Number of motion vector predictor candidates (1 or 2)
    pub num_mvp_cand: u8,
    /// pps_cb_qp_offset + slice_cb_qp_offset
    pub cb_qp_offset: i8,
    /// pps_cr_qp_offset + slice_cr_qp_offset
    pub cr_qp_offset: i8,
    /// Weight applied to chroma distortion
    pub chroma_distortion_weight: f64,
    /// Optional tools
    pub tools: CodingTools,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::hevc_main()
    }
}

impl CodecConfig {
    /// 8-bit 4:2:0, 64x64 CTBs and 4..32 transforms
    pub fn hevc_main() -> Self {
        Self {
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            chroma_format: ChromaFormat::Yuv420,
            log2_ctb_size: 6,
            log2_min_cb_size: 3,
            log2_min_tb_size: 2,
            log2_max_tb_size: 5,
            max_tu_depth_intra: 1,
            max_tu_depth_inter: 2,
            max_num_merge_cand: 5,
            num_mvp_cand: 2,
            cb_qp_offset: 0,
            cr_qp_offset: 0,
            chroma_distortion_weight: 1.0,
            tools: CodingTools::default(),
        }
    }

    /// Extended tool set with 64x64 transforms
    pub fn extended() -> Self {
        Self {
            log2_ctb_size: 7,
            log2_max_tb_size: 6,
            tools: CodingTools::extended(),
            ..Self::hevc_main()
        }
    }

    /// Check parameter ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        for (name, depth) in [
            ("bit_depth_luma", self.bit_depth_luma),
            ("bit_depth_chroma", self.bit_depth_chroma),
        ] {
            if !matches!(depth, 8 | 10 | 12) {
                return Err(Error::config(format!(
                    "{} must be 8, 10 or 12, got {}",
                    name, depth
                )));
            }
        }

        if !(4..=7).contains(&self.log2_ctb_size) {
            return Err(Error::config(format!(
                "log2_ctb_size {} out of range 4..=7",
                self.log2_ctb_size
            )));
        }
        if self.log2_min_cb_size < 3 || self.log2_min_cb_size > self.log2_ctb_size {
            return Err(Error::config(format!(
                "log2_min_cb_size {} out of range 3..={}",
                self.log2_min_cb_size, self.log2_ctb_size
            )));
        }
        if self.log2_min_tb_size < 2 || self.log2_min_tb_size >= self.log2_min_cb_size {
            return Err(Error::config(format!(
                "log2_min_tb_size {} must be in 2..{}",
                self.log2_min_tb_size, self.log2_min_cb_size
            )));
        }
        let max_tb_limit = self.log2_ctb_size.min(6);
        if self.log2_max_tb_size < self.log2_min_tb_size || self.log2_max_tb_size > max_tb_limit {
            return Err(Error::config(format!(
                "log2_max_tb_size {} out of range {}..={}",
                self.log2_max_tb_size, self.log2_min_tb_size, max_tb_limit
            )));
        }
        let max_depth = self.log2_ctb_size - self.log2_min_tb_size;
        if self.max_tu_depth_intra > max_depth || self.max_tu_depth_inter > max_depth {
            return Err(Error::config(format!(
                "transform hierarchy depth exceeds {}",
                max_depth
            )));
        }
        if !(1..=5).contains(&self.max_num_merge_cand) {
            return Err(Error::config(format!(
                "max_num_merge_cand {} out of range 1..=5",
                self.max_num_merge_cand
            )));
        }
        if !(1..=2).contains(&self.num_mvp_cand) {
            return Err(Error::config(format!(
                "num_mvp_cand {} out of range 1..=2",
                self.num_mvp_cand
            )));
        }
        for (name, offset) in [("cb_qp_offset", self.cb_qp_offset), ("cr_qp_offset", self.cr_qp_offset)] {
            if !(-12..=12).contains(&offset) {
                return Err(Error::config(format!(
                    "{} {} out of range -12..=12",
                    name, offset
                )));
            }
        }
        if self.chroma_distortion_weight.is_nan() || self.chroma_distortion_weight <= 0.0 {
            return Err(Error::config("chroma_distortion_weight must be positive"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CodecConfig = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize configuration: {}", e)))
    }

    /// QpBdOffsetY
    pub fn qp_bd_offset_luma(&self) -> i32 {
        6 * (self.bit_depth_luma as i32 - 8)
    }

    /// QpBdOffsetC
    pub fn qp_bd_offset_chroma(&self) -> i32 {
        6 * (self.bit_depth_chroma as i32 - 8)
    }

    /// Bit depth for a component index (0 luma, 1/2 chroma)
    pub fn bit_depth(&self, c_idx: usize) -> u8 {
        if c_idx == 0 {
            self.bit_depth_luma
        } else {
            self.bit_depth_chroma
        }
    }
}
