//! Entropy coder adapter
//!
//! [`EntropyEncoder`] and [`EntropyDecoder`] sequence the CU-level syntax in
//! bitstream order and decide which elements are present. A symbol that is
//! not present is never handed to the symbol codec; the decoder infers the
//! same value the encoder assumed. Context increments that depend on
//! neighboring CUs and the most probable mode lists are derived here.
//!
//! The residual part of a CU (transform tree) is delegated to the `tu`
//! module, ALF parameter sets to the `alf` module.

use super::alf::{self, AlfParams, AlfStore};
use super::config::{ChromaFormat, CodecConfig, SliceType};
use super::ctu::{CodingUnit, CuNeighbors, InterDir, PartMode, PredMode, PredictionUnit};
use super::sbac::{PartModeCtx, SymbolDecoder, SymbolEncoder};
use super::tu::{self, TransformTree};
use crate::error::{Error, Result};

/// Planar intra mode
pub const PLANAR_IDX: u8 = 0;
/// DC intra mode
pub const DC_IDX: u8 = 1;

/// Chroma symbol meaning "same as luma"
const DM_SYMBOL: u8 = 4;

/// 4:2:2 chroma mode mapping, 35 modes
const CHROMA_422_MAP_35: [u8; 35] = [
    0, 1, 2, 2, 2, 2, 3, 5, 7, 8, 10, 11, 13, 15, 16, 18, 19, 20, 21, 22, 23, 23, 24, 24, 25,
    25, 26, 27, 27, 28, 28, 29, 29, 30, 31,
];

/// 4:2:2 chroma mode mapping, 67 modes
const CHROMA_422_MAP_67: [u8; 67] = [
    0, 1, 2, 2, 2, 2, 2, 2, 2, 3, 4, 6, 8, 10, 12, 13, 14, 16, 18, 20, 22, 23, 24, 26, 28, 30,
    32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 44, 44, 45, 46, 46, 46, 47, 48, 48, 48,
    49, 50, 51, 52, 52, 52, 53, 54, 54, 54, 55, 56, 56, 56, 57, 58, 59, 60,
];

/// Slice-level inputs to CU syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceParams {
    pub slice_type: SliceType,
    /// SliceQpY
    pub qp: i32,
    /// Active references in list 0 and list 1
    pub num_ref_idx: [u8; 2],
    /// ALF CU control depth, `None` when CU control flags are off
    pub alf_cu_control_depth: Option<u8>,
}

impl SliceParams {
    pub fn new(slice_type: SliceType, qp: i32) -> Self {
        let num_ref_idx = match slice_type {
            SliceType::I => [0, 0],
            SliceType::P => [1, 0],
            SliceType::B => [1, 1],
        };
        Self {
            slice_type,
            qp,
            num_ref_idx,
            alf_cu_control_depth: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode derivation
// ─────────────────────────────────────────────────────────────────────────────

/// Most probable intra modes, 3 or 6 entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpmList {
    modes: [u8; 6],
    len: usize,
}

impl MpmList {
    fn push_unique(&mut self, mode: u8) {
        if self.len < self.modes.len() && !self.as_slice().contains(&mode) {
            self.modes[self.len] = mode;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.modes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of `mode` in the list
    pub fn index_of(&self, mode: u8) -> Option<usize> {
        self.as_slice().iter().position(|&m| m == mode)
    }

    /// Non-MPM remainder of `mode`
    pub fn remainder(&self, mode: u8) -> u8 {
        mode - self.as_slice().iter().filter(|&&m| m < mode).count() as u8
    }

    /// Mode of a non-MPM remainder
    pub fn mode_from_remainder(&self, rem: u8) -> u8 {
        let mut sorted = self.modes;
        sorted[..self.len].sort_unstable();
        let mut mode = rem;
        for &m in &sorted[..self.len] {
            if mode >= m {
                mode += 1;
            }
        }
        mode
    }
}

/// Three-entry MPM list of the 35-mode scheme; unavailable neighbors count as DC
pub fn derive_mpm_3(left: Option<u8>, above: Option<u8>) -> MpmList {
    let a = left.unwrap_or(DC_IDX);
    let b = above.unwrap_or(DC_IDX);
    let modes = if a == b {
        if a < 2 {
            [PLANAR_IDX, DC_IDX, 26]
        } else {
            [a, 2 + ((a + 29) % 32), 2 + ((a - 2 + 1) % 32)]
        }
    } else {
        let c = if a != PLANAR_IDX && b != PLANAR_IDX {
            PLANAR_IDX
        } else if a != DC_IDX && b != DC_IDX {
            DC_IDX
        } else {
            26
        };
        [a, b, c]
    };
    MpmList {
        modes: [modes[0], modes[1], modes[2], 0, 0, 0],
        len: 3,
    }
}

/// Six-entry MPM list of the 67-mode scheme
pub fn derive_mpm_6(left: Option<u8>, above: Option<u8>) -> MpmList {
    let mut list = MpmList { modes: [0; 6], len: 0 };
    if let Some(mode) = left {
        list.push_unique(mode);
    }
    if let Some(mode) = above {
        list.push_unique(mode);
    }
    list.push_unique(PLANAR_IDX);
    list.push_unique(DC_IDX);

    let mut i = 0;
    while list.len < 6 && i < list.len {
        let mode = list.modes[i];
        if mode > DC_IDX {
            list.push_unique(((mode + 62) % 65) + 2);
            list.push_unique(((mode - 1) % 65) + 2);
        }
        i += 1;
    }
    for mode in [50, 18, 2, 34] {
        list.push_unique(mode);
    }
    list
}

/// MPM list for the configured mode count
pub fn derive_mpm(extended_modes: bool, left: Option<u8>, above: Option<u8>) -> MpmList {
    if extended_modes {
        derive_mpm_6(left, above)
    } else {
        derive_mpm_3(left, above)
    }
}

fn vertical_mode(num_modes: u8) -> u8 {
    if num_modes == 67 {
        50
    } else {
        26
    }
}

fn horizontal_mode(num_modes: u8) -> u8 {
    if num_modes == 67 {
        18
    } else {
        10
    }
}

/// Explicit chroma candidates: planar, vertical, horizontal, DC; a
/// candidate equal to the luma mode is replaced by the last diagonal mode
pub fn chroma_candidates(luma_mode: u8, num_modes: u8) -> [u8; 4] {
    let mut list = [
        PLANAR_IDX,
        vertical_mode(num_modes),
        horizontal_mode(num_modes),
        DC_IDX,
    ];
    for mode in list.iter_mut() {
        if *mode == luma_mode {
            *mode = num_modes - 1;
        }
    }
    list
}

/// Chroma mode of a decoded intra_chroma_pred_mode symbol
pub fn chroma_mode_from_symbol(symbol: u8, luma_mode: u8, num_modes: u8) -> u8 {
    if symbol == DM_SYMBOL {
        luma_mode
    } else {
        chroma_candidates(luma_mode, num_modes)[symbol as usize]
    }
}

/// intra_chroma_pred_mode symbol of a chroma mode, `None` when not signalable
pub fn chroma_symbol(chroma_mode: u8, luma_mode: u8, num_modes: u8) -> Option<u8> {
    if chroma_mode == luma_mode {
        return Some(DM_SYMBOL);
    }
    chroma_candidates(luma_mode, num_modes)
        .iter()
        .position(|&m| m == chroma_mode)
        .map(|i| i as u8)
}

/// Chroma prediction mode after the 4:2:2 angle mapping
pub fn chroma_mode_for_format(mode: u8, format: ChromaFormat, num_modes: u8) -> u8 {
    if format != ChromaFormat::Yuv422 {
        return mode;
    }
    if num_modes == 67 {
        CHROMA_422_MAP_67.get(mode as usize).copied().unwrap_or(mode)
    } else {
        CHROMA_422_MAP_35.get(mode as usize).copied().unwrap_or(mode)
    }
}

/// Left/above luma modes seen by prediction unit `pu` of an intra CU
fn mpm_neighbors(
    cu_modes: &[u8; 4],
    part: PartMode,
    pu: usize,
    neighbors: &CuNeighbors,
) -> (Option<u8>, Option<u8>) {
    let left = neighbors.left.and_then(|n| n.intra_mode);
    let above = if neighbors.above_in_ctu {
        neighbors.above.and_then(|n| n.intra_mode)
    } else {
        None
    };
    if part != PartMode::PartNxN {
        return (left, above);
    }
    match pu {
        0 => (left, above),
        1 => (Some(cu_modes[0]), above),
        2 => (left, Some(cu_modes[0])),
        _ => (Some(cu_modes[2]), Some(cu_modes[1])),
    }
}

fn split_cu_ctx(depth: u8, neighbors: &CuNeighbors) -> usize {
    neighbors.count(|n| n.depth > depth)
}

fn alf_flag_present(config: &CodecConfig, slice: &SliceParams, cu: &CodingUnit) -> bool {
    match slice.alf_cu_control_depth {
        Some(max_depth) if config.tools.alf => {
            if cu.depth <= max_depth {
                return true;
            }
            let ctrl_size = 1usize << config.log2_ctb_size.saturating_sub(max_depth);
            cu.x % ctrl_size == 0 && cu.y % ctrl_size == 0
        }
        _ => false,
    }
}

fn affine_present(config: &CodecConfig, cu: &CodingUnit) -> bool {
    config.tools.affine && cu.part_mode == PartMode::Part2Nx2N && cu.log2_size >= 3
}

fn obmc_present(config: &CodecConfig, cu: &CodingUnit) -> bool {
    config.tools.obmc && !cu.is_merge_2nx2n() && cu.log2_size <= 4
}

/// emt_cu_flag may be coded for this CU
pub fn emt_cu_flag_present(config: &CodecConfig, cu: &CodingUnit) -> bool {
    let enabled = match cu.pred_mode {
        PredMode::Intra => config.tools.emt_intra,
        PredMode::Inter => config.tools.emt_inter,
    };
    enabled && cu.log2_size <= 5 && !cu.transquant_bypass
}

fn small_pu(cu: &CodingUnit, part_idx: usize) -> bool {
    let (w, h) = cu.part_mode.pu_size(cu.log2_size, part_idx);
    w + h == 12
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoder
// ─────────────────────────────────────────────────────────────────────────────

/// Encoder side of the adapter; one instance covers a whole slice
pub struct EntropyEncoder<'a, S: SymbolEncoder> {
    codec: &'a mut S,
    config: &'a CodecConfig,
    slice: SliceParams,
    /// Last coded ALF control flag, inherited by CUs inside its control block
    alf_ctrl_flag: bool,
}

impl<'a, S: SymbolEncoder> EntropyEncoder<'a, S> {
    pub fn new(codec: &'a mut S, config: &'a CodecConfig, slice: SliceParams) -> Self {
        Self {
            codec,
            config,
            slice,
            alf_ctrl_flag: false,
        }
    }

    pub fn codec(&mut self) -> &mut S {
        &mut *self.codec
    }

    pub fn slice(&self) -> &SliceParams {
        &self.slice
    }

    /// split_cu_flag; absent (no split) at the minimum CU size
    pub fn encode_split_cu_flag(&mut self, log2_cb: u8, depth: u8, split: bool, neighbors: &CuNeighbors) {
        if log2_cb > self.config.log2_min_cb_size {
            self.codec.encode_split_cu_flag(split, split_cu_ctx(depth, neighbors));
        }
    }

    pub fn encode_cu_transquant_bypass_flag(&mut self, cu: &CodingUnit) {
        if self.config.tools.transquant_bypass {
            self.codec.encode_cu_transquant_bypass_flag(cu.transquant_bypass);
        }
    }

    /// cu_skip_flag; never coded in I slices
    pub fn encode_skip_flag(&mut self, cu: &CodingUnit, neighbors: &CuNeighbors) {
        if self.slice.slice_type.is_intra() {
            return;
        }
        self.codec.encode_skip_flag(cu.skip, neighbors.count(|n| n.skip));
    }

    /// merge_idx; absent with a single merge candidate
    pub fn encode_merge_idx(&mut self, pu: &PredictionUnit) {
        if self.config.max_num_merge_cand > 1 {
            self.codec.encode_merge_idx(pu.merge_idx, self.config.max_num_merge_cand);
        }
    }

    /// pred_mode_flag; absent in I slices
    pub fn encode_pred_mode(&mut self, cu: &CodingUnit) {
        if !self.slice.slice_type.is_intra() {
            self.codec.encode_pred_mode_flag(cu.is_intra());
        }
    }

    fn part_mode_ctx(&self, cu: &CodingUnit) -> PartModeCtx {
        PartModeCtx {
            intra: cu.is_intra(),
            log2_cb: cu.log2_size,
            log2_min_cb: self.config.log2_min_cb_size,
            amp: self.config.tools.amp,
        }
    }

    /// part_mode; intra CUs only signal it at the minimum CU size
    pub fn encode_part_mode(&mut self, cu: &CodingUnit) {
        if cu.is_intra() && cu.log2_size != self.config.log2_min_cb_size {
            return;
        }
        let ctx = self.part_mode_ctx(cu);
        self.codec.encode_part_mode(cu.part_mode, ctx);
    }

    /// Luma intra directions: all MPM flags first, then indices or remainders
    pub fn encode_intra_dir_luma(&mut self, cu: &CodingUnit, neighbors: &CuNeighbors) -> Result<()> {
        let tools = &self.config.tools;
        let num_parts = if cu.part_mode == PartMode::PartNxN { 4 } else { 1 };
        let num_modes = tools.num_intra_modes();

        let mut coded = [(None, 0u8); 4];
        for (pu, slot) in coded.iter_mut().enumerate().take(num_parts) {
            let mode = cu.intra_luma_modes[pu];
            if mode >= num_modes {
                return Err(Error::invalid_input(format!("intra mode {} out of range", mode)));
            }
            let (left, above) = mpm_neighbors(&cu.intra_luma_modes, cu.part_mode, pu, neighbors);
            let mpm = derive_mpm(tools.extended_intra_modes, left, above);
            *slot = match mpm.index_of(mode) {
                Some(idx) => (Some(idx as u8), 0),
                None => (None, mpm.remainder(mode)),
            };
            self.codec.encode_prev_intra_luma_pred_flag(slot.0.is_some());
        }
        let rem_bits = if tools.extended_intra_modes { 6 } else { 5 };
        for &(mpm_idx, rem) in coded.iter().take(num_parts) {
            match mpm_idx {
                Some(idx) => self.codec.encode_mpm_idx(idx, tools.num_mpm()),
                None => self.codec.encode_rem_intra_luma_pred_mode(rem, rem_bits),
            }
        }
        Ok(())
    }

    /// Chroma intra direction; absent for 4:0:0
    pub fn encode_intra_dir_chroma(&mut self, cu: &CodingUnit) -> Result<()> {
        if !self.config.chroma_format.has_chroma() {
            return Ok(());
        }
        let num_modes = self.config.tools.num_intra_modes();
        let symbol = chroma_symbol(cu.intra_chroma_mode, cu.intra_luma_modes[0], num_modes)
            .ok_or_else(|| {
                Error::invalid_input(format!(
                    "chroma mode {} is not signalable with luma mode {}",
                    cu.intra_chroma_mode, cu.intra_luma_modes[0]
                ))
            })?;
        self.codec.encode_intra_chroma_pred_mode(symbol);
        Ok(())
    }

    /// inter_pred_idc; only B slices signal a direction
    pub fn encode_inter_dir(&mut self, cu: &CodingUnit, part_idx: usize) -> Result<()> {
        let pu = &cu.pus[part_idx];
        if self.slice.slice_type != SliceType::B {
            if pu.inter_dir != InterDir::L0 {
                return Err(Error::invalid_input("P slices only predict from list 0"));
            }
            return Ok(());
        }
        let small = small_pu(cu, part_idx);
        if small && pu.inter_dir == InterDir::Bi {
            return Err(Error::invalid_input("bi-prediction is not allowed for 8x4/4x8 PUs"));
        }
        self.codec.encode_inter_pred_idc(pu.inter_dir, small, cu.depth);
        Ok(())
    }

    /// ref_idx_lX; absent with a single active reference
    pub fn encode_ref_idx(&mut self, pu: &PredictionUnit, list: usize) {
        let num_ref = self.slice.num_ref_idx[list];
        if num_ref > 1 {
            self.codec.encode_ref_idx(pu.ref_idx[list], num_ref);
        }
    }

    /// mvp_lX_flag; absent with a single predictor candidate
    pub fn encode_mvp_idx(&mut self, pu: &PredictionUnit, list: usize) {
        if self.config.num_mvp_cand > 1 {
            self.codec.encode_mvp_idx(pu.mvp_idx[list]);
        }
    }

    fn encode_prediction_unit(&mut self, cu: &CodingUnit, part_idx: usize) -> Result<()> {
        let pu = cu.pus[part_idx];
        self.codec.encode_merge_flag(pu.merge_flag);
        if pu.merge_flag {
            self.encode_merge_idx(&pu);
            return Ok(());
        }
        self.encode_inter_dir(cu, part_idx)?;
        for list in 0..2 {
            if pu.inter_dir.uses_list(list) {
                self.encode_ref_idx(&pu, list);
                self.codec.encode_mvd(pu.mvd[list]);
                self.encode_mvp_idx(&pu, list);
            }
        }
        Ok(())
    }

    /// ALF on/off flag of a CU under CU control
    ///
    /// A CU below the control depth that does not start a control block
    /// shares the flag coded for that block.
    pub fn encode_alf_ctrl_flag(&mut self, cu: &CodingUnit, neighbors: &CuNeighbors) -> Result<()> {
        if alf_flag_present(self.config, &self.slice, cu) {
            self.codec
                .encode_alf_ctrl_flag(cu.alf_flag, neighbors.count(|n| n.alf_flag));
            self.alf_ctrl_flag = cu.alf_flag;
        } else if self.config.tools.alf
            && self.slice.alf_cu_control_depth.is_some()
            && cu.alf_flag != self.alf_ctrl_flag
        {
            return Err(Error::invalid_input(format!(
                "CU at ({}, {}) must share the ALF flag of its control block",
                cu.x, cu.y
            )));
        }
        Ok(())
    }

    /// Full coding_unit syntax; `tree` carries the residual when the CU has one
    pub fn encode_coding_unit(
        &mut self,
        cu: &CodingUnit,
        neighbors: &CuNeighbors,
        tree: Option<&TransformTree>,
        qp_pred: i32,
    ) -> Result<()> {
        if cu.pus.len() != cu.part_mode.num_parts() && !cu.is_intra() {
            return Err(Error::invalid_input("inter CU needs one PU per partition"));
        }
        if cu.skip && self.slice.slice_type == SliceType::I {
            return Err(Error::invalid_input("skipped CU in an intra slice"));
        }
        self.encode_alf_ctrl_flag(cu, neighbors)?;
        self.encode_cu_transquant_bypass_flag(cu);
        self.encode_skip_flag(cu, neighbors);

        if cu.skip {
            if affine_present(self.config, cu) {
                self.codec.encode_affine_flag(cu.affine, neighbors.count(|n| n.affine));
            }
            let pu = cu.pus.first().copied().unwrap_or_default();
            self.encode_merge_idx(&pu);
            return Ok(());
        }

        self.encode_pred_mode(cu);
        self.encode_part_mode(cu);

        if cu.is_intra() {
            self.encode_intra_dir_luma(cu, neighbors)?;
            self.encode_intra_dir_chroma(cu)?;
        } else {
            if affine_present(self.config, cu) {
                self.codec.encode_affine_flag(cu.affine, neighbors.count(|n| n.affine));
            }
            for part_idx in 0..cu.part_mode.num_parts() {
                self.encode_prediction_unit(cu, part_idx)?;
            }
            if obmc_present(self.config, cu) {
                self.codec.encode_obmc_flag(cu.obmc);
            }
            if !cu.is_merge_2nx2n() {
                self.codec.encode_rqt_root_cbf(cu.root_cbf);
            } else if !cu.root_cbf {
                return Err(Error::invalid_input(
                    "merge 2Nx2N CU without residual must be coded as skip",
                ));
            }
        }

        if !cu.root_cbf {
            return Ok(());
        }
        let tree = tree.ok_or_else(|| Error::invalid_input("CU with residual has no transform tree"))?;
        tu::encode_transform_tree(self.codec, self.config, cu, tree, qp_pred)
    }

    /// Slice ALF parameters; newly sent luma filters are pushed to `store`
    pub fn encode_alf_params(&mut self, params: &AlfParams, store: &mut AlfStore) -> Result<()> {
        if !self.config.tools.alf {
            return Ok(());
        }
        alf::encode_alf_params(self.codec, params, store, self.config.chroma_format)
    }

    pub fn encode_end_of_slice_segment_flag(&mut self, last: bool) {
        self.codec.encode_end_of_slice_segment_flag(last);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoder
// ─────────────────────────────────────────────────────────────────────────────

/// Decoder side of the adapter; one instance covers a whole slice
pub struct EntropyDecoder<'a, S: SymbolDecoder> {
    codec: &'a mut S,
    config: &'a CodecConfig,
    slice: SliceParams,
    alf_ctrl_flag: bool,
}

impl<'a, S: SymbolDecoder> EntropyDecoder<'a, S> {
    pub fn new(codec: &'a mut S, config: &'a CodecConfig, slice: SliceParams) -> Self {
        Self {
            codec,
            config,
            slice,
            alf_ctrl_flag: false,
        }
    }

    pub fn codec(&mut self) -> &mut S {
        &mut *self.codec
    }

    pub fn slice(&self) -> &SliceParams {
        &self.slice
    }

    pub fn decode_split_cu_flag(&mut self, log2_cb: u8, depth: u8, neighbors: &CuNeighbors) -> Result<bool> {
        if log2_cb > self.config.log2_min_cb_size {
            self.codec.decode_split_cu_flag(split_cu_ctx(depth, neighbors))
        } else {
            Ok(false)
        }
    }

    pub fn decode_cu_transquant_bypass_flag(&mut self) -> Result<bool> {
        if self.config.tools.transquant_bypass {
            self.codec.decode_cu_transquant_bypass_flag()
        } else {
            Ok(false)
        }
    }

    pub fn decode_skip_flag(&mut self, neighbors: &CuNeighbors) -> Result<bool> {
        if self.slice.slice_type.is_intra() {
            return Ok(false);
        }
        self.codec.decode_skip_flag(neighbors.count(|n| n.skip))
    }

    pub fn decode_merge_idx(&mut self) -> Result<u8> {
        if self.config.max_num_merge_cand > 1 {
            self.codec.decode_merge_idx(self.config.max_num_merge_cand)
        } else {
            Ok(0)
        }
    }

    pub fn decode_pred_mode(&mut self) -> Result<PredMode> {
        if self.slice.slice_type.is_intra() || self.codec.decode_pred_mode_flag()? {
            Ok(PredMode::Intra)
        } else {
            Ok(PredMode::Inter)
        }
    }

    pub fn decode_part_mode(&mut self, cu: &CodingUnit) -> Result<PartMode> {
        if cu.is_intra() && cu.log2_size != self.config.log2_min_cb_size {
            return Ok(PartMode::Part2Nx2N);
        }
        let ctx = PartModeCtx {
            intra: cu.is_intra(),
            log2_cb: cu.log2_size,
            log2_min_cb: self.config.log2_min_cb_size,
            amp: self.config.tools.amp,
        };
        self.codec.decode_part_mode(ctx)
    }

    pub fn decode_intra_dir_luma(&mut self, cu: &mut CodingUnit, neighbors: &CuNeighbors) -> Result<()> {
        let tools = self.config.tools;
        let num_parts = if cu.part_mode == PartMode::PartNxN { 4 } else { 1 };
        let num_modes = tools.num_intra_modes();

        let mut mpm_flags = [false; 4];
        for flag in mpm_flags.iter_mut().take(num_parts) {
            *flag = self.codec.decode_prev_intra_luma_pred_flag()?;
        }
        let rem_bits = if tools.extended_intra_modes { 6 } else { 5 };
        for pu in 0..num_parts {
            let (left, above) = mpm_neighbors(&cu.intra_luma_modes, cu.part_mode, pu, neighbors);
            let mpm = derive_mpm(tools.extended_intra_modes, left, above);
            let mode = if mpm_flags[pu] {
                let idx = self.codec.decode_mpm_idx(tools.num_mpm())?;
                mpm.as_slice()[idx as usize]
            } else {
                let rem = self.codec.decode_rem_intra_luma_pred_mode(rem_bits)?;
                mpm.mode_from_remainder(rem)
            };
            if mode >= num_modes {
                tracing::warn!("decoded intra mode {} exceeds {} modes", mode, num_modes);
                return Err(Error::conformance(format!("intra luma mode {} out of range", mode)));
            }
            cu.intra_luma_modes[pu] = mode;
        }
        if num_parts == 1 {
            cu.intra_luma_modes = [cu.intra_luma_modes[0]; 4];
        }
        Ok(())
    }

    pub fn decode_intra_dir_chroma(&mut self, cu: &mut CodingUnit) -> Result<()> {
        if !self.config.chroma_format.has_chroma() {
            cu.intra_chroma_mode = cu.intra_luma_modes[0];
            return Ok(());
        }
        let symbol = self.codec.decode_intra_chroma_pred_mode()?;
        cu.intra_chroma_mode =
            chroma_mode_from_symbol(symbol, cu.intra_luma_modes[0], self.config.tools.num_intra_modes());
        Ok(())
    }

    pub fn decode_inter_dir(&mut self, cu: &CodingUnit, part_idx: usize) -> Result<InterDir> {
        if self.slice.slice_type != SliceType::B {
            return Ok(InterDir::L0);
        }
        self.codec.decode_inter_pred_idc(small_pu(cu, part_idx), cu.depth)
    }

    pub fn decode_ref_idx(&mut self, list: usize) -> Result<u8> {
        let num_ref = self.slice.num_ref_idx[list];
        if num_ref > 1 {
            self.codec.decode_ref_idx(num_ref)
        } else {
            Ok(0)
        }
    }

    pub fn decode_mvp_idx(&mut self) -> Result<u8> {
        if self.config.num_mvp_cand > 1 {
            self.codec.decode_mvp_idx()
        } else {
            Ok(0)
        }
    }

    fn decode_prediction_unit(&mut self, cu: &CodingUnit, part_idx: usize) -> Result<PredictionUnit> {
        let mut pu = PredictionUnit {
            merge_flag: self.codec.decode_merge_flag()?,
            ..Default::default()
        };
        if pu.merge_flag {
            pu.merge_idx = self.decode_merge_idx()?;
            return Ok(pu);
        }
        pu.inter_dir = self.decode_inter_dir(cu, part_idx)?;
        for list in 0..2 {
            if pu.inter_dir.uses_list(list) {
                pu.ref_idx[list] = self.decode_ref_idx(list)?;
                pu.mvd[list] = self.codec.decode_mvd()?;
                pu.mvp_idx[list] = self.decode_mvp_idx()?;
            }
        }
        Ok(pu)
    }

    pub fn decode_alf_ctrl_flag(&mut self, cu: &CodingUnit, neighbors: &CuNeighbors) -> Result<bool> {
        if alf_flag_present(self.config, &self.slice, cu) {
            self.alf_ctrl_flag = self.codec.decode_alf_ctrl_flag(neighbors.count(|n| n.alf_flag))?;
            Ok(self.alf_ctrl_flag)
        } else if self.config.tools.alf {
            match self.slice.alf_cu_control_depth {
                Some(_) => Ok(self.alf_ctrl_flag),
                None => Ok(true),
            }
        } else {
            Ok(false)
        }
    }

    /// Full coding_unit syntax of the CU at (`x`, `y`)
    pub fn decode_coding_unit(
        &mut self,
        x: usize,
        y: usize,
        log2_size: u8,
        depth: u8,
        neighbors: &CuNeighbors,
        qp_pred: i32,
    ) -> Result<(CodingUnit, Option<TransformTree>)> {
        let mut cu = CodingUnit::new(x, y, log2_size, depth);
        cu.qp = qp_pred;
        cu.alf_flag = self.decode_alf_ctrl_flag(&cu, neighbors)?;
        cu.transquant_bypass = self.decode_cu_transquant_bypass_flag()?;
        cu.skip = self.decode_skip_flag(neighbors)?;

        if cu.skip {
            cu.pred_mode = PredMode::Inter;
            cu.root_cbf = false;
            cu.obmc = self.config.tools.obmc;
            if affine_present(self.config, &cu) {
                cu.affine = self.codec.decode_affine_flag(neighbors.count(|n| n.affine))?;
            }
            let merge_idx = self.decode_merge_idx()?;
            cu.pus = vec![PredictionUnit {
                merge_flag: true,
                merge_idx,
                ..Default::default()
            }];
            return Ok((cu, None));
        }

        cu.pred_mode = self.decode_pred_mode()?;
        cu.part_mode = self.decode_part_mode(&cu)?;

        if cu.is_intra() {
            self.decode_intra_dir_luma(&mut cu, neighbors)?;
            self.decode_intra_dir_chroma(&mut cu)?;
        } else {
            if affine_present(self.config, &cu) {
                cu.affine = self.codec.decode_affine_flag(neighbors.count(|n| n.affine))?;
            }
            for part_idx in 0..cu.part_mode.num_parts() {
                let pu = self.decode_prediction_unit(&cu, part_idx)?;
                cu.pus.push(pu);
            }
            cu.obmc = if obmc_present(self.config, &cu) {
                self.codec.decode_obmc_flag()?
            } else {
                self.config.tools.obmc
            };
            cu.root_cbf = if cu.is_merge_2nx2n() {
                true
            } else {
                self.codec.decode_rqt_root_cbf()?
            };
        }

        if !cu.root_cbf {
            return Ok((cu, None));
        }
        let tree = tu::decode_transform_tree(self.codec, self.config, &mut cu, qp_pred)?;
        Ok((cu, Some(tree)))
    }

    /// Slice ALF parameters; stores newly sent luma filters in `store`
    pub fn decode_alf_params(&mut self, store: &mut AlfStore) -> Result<AlfParams> {
        if !self.config.tools.alf {
            return Ok(AlfParams::disabled());
        }
        alf::decode_alf_params(self.codec, store, self.config.chroma_format)
    }

    pub fn decode_end_of_slice_segment_flag(&mut self) -> Result<bool> {
        self.codec.decode_end_of_slice_segment_flag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::cabac::{CabacReader, CabacWriter};
    use crate::codec::h265::ctu::NeighborCu;
    use crate::codec::h265::sbac::Sbac;

    #[test]
    fn test_mpm3_rules() {
        assert_eq!(derive_mpm_3(None, None).as_slice(), &[0, 1, 26]);
        assert_eq!(derive_mpm_3(Some(10), Some(10)).as_slice(), &[10, 9, 11]);
        assert_eq!(derive_mpm_3(Some(2), Some(2)).as_slice(), &[2, 33, 3]);
        assert_eq!(derive_mpm_3(Some(0), Some(1)).as_slice(), &[0, 1, 26]);
        assert_eq!(derive_mpm_3(Some(5), Some(0)).as_slice(), &[5, 0, 1]);
        assert_eq!(derive_mpm_3(Some(5), Some(9)).as_slice(), &[5, 9, 0]);
    }

    #[test]
    fn test_mpm6_is_unique_and_full() {
        for left in [None, Some(0), Some(1), Some(2), Some(34), Some(66)] {
            for above in [None, Some(0), Some(18), Some(50), Some(66)] {
                let list = derive_mpm_6(left, above);
                assert_eq!(list.len(), 6);
                let mut sorted = list.as_slice().to_vec();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), 6);
                assert!(list.as_slice().iter().all(|&m| m < 67));
            }
        }
        assert_eq!(derive_mpm_6(Some(2), None).as_slice(), &[2, 0, 1, 66, 3, 65]);
    }

    #[test]
    fn test_remainder_mapping_is_bijective() {
        for (list, modes) in [(derive_mpm_3(Some(7), Some(20)), 35u8), (derive_mpm_6(Some(40), Some(3)), 67)] {
            let mut rem_seen = Vec::new();
            for mode in 0..modes {
                if list.index_of(mode).is_some() {
                    continue;
                }
                let rem = list.remainder(mode);
                assert_eq!(list.mode_from_remainder(rem), mode);
                rem_seen.push(rem);
            }
            let expected: Vec<u8> = (0..modes - list.len() as u8).collect();
            assert_eq!(rem_seen, expected);
        }
    }

    #[test]
    fn test_chroma_symbols() {
        assert_eq!(chroma_candidates(26, 35), [0, 34, 10, 1]);
        assert_eq!(chroma_symbol(26, 26, 35), Some(4));
        assert_eq!(chroma_symbol(34, 26, 35), Some(1));
        assert_eq!(chroma_symbol(7, 26, 35), None);
        assert_eq!(chroma_mode_from_symbol(2, 18, 67), 66);
        assert_eq!(chroma_mode_for_format(18, ChromaFormat::Yuv422, 35), 21);
        assert_eq!(chroma_mode_for_format(26, ChromaFormat::Yuv420, 35), 26);
    }

    #[test]
    fn test_intra_slice_omits_skip_and_pred_mode() {
        let config = CodecConfig::hevc_main();
        let slice = SliceParams::new(SliceType::I, 32);
        let mut cu = CodingUnit::new(0, 0, 4, 2);
        cu.intra_luma_modes = [26; 4];
        cu.intra_chroma_mode = 26;
        let neighbors = CuNeighbors::default();

        let mut enc = Sbac::new(CabacWriter::new(), SliceType::I, 32);
        let before = enc.frac_bits();
        let mut adapter = EntropyEncoder::new(&mut enc, &config, slice);
        adapter.encode_skip_flag(&cu, &neighbors);
        adapter.encode_pred_mode(&cu);
        adapter.encode_part_mode(&cu);
        assert_eq!(adapter.codec().frac_bits(), before);
    }

    #[test]
    fn test_nxn_intra_modes_roundtrip() {
        let config = CodecConfig::hevc_main();
        let slice = SliceParams::new(SliceType::P, 30);
        let neighbors = CuNeighbors {
            left: Some(NeighborCu { intra_mode: Some(10), ..Default::default() }),
            above: Some(NeighborCu { intra_mode: None, ..Default::default() }),
            above_in_ctu: true,
        };
        let mut cu = CodingUnit::new(0, 0, 3, 3);
        cu.part_mode = PartMode::PartNxN;
        cu.intra_luma_modes = [10, 3, 10, 34];
        cu.intra_chroma_mode = 0;

        let mut enc = Sbac::new(CabacWriter::new(), SliceType::P, 30);
        let mut adapter = EntropyEncoder::new(&mut enc, &config, slice);
        adapter.encode_pred_mode(&cu);
        adapter.encode_part_mode(&cu);
        adapter.encode_intra_dir_luma(&cu, &neighbors).unwrap();
        adapter.encode_intra_dir_chroma(&cu).unwrap();
        enc.encode_end_of_slice_segment_flag(true);
        let data = enc.into_inner().finish();

        let mut dec = Sbac::new(CabacReader::new(&data).unwrap(), SliceType::P, 30);
        let mut adapter = EntropyDecoder::new(&mut dec, &config, slice);
        let mut out = CodingUnit::new(0, 0, 3, 3);
        out.pred_mode = adapter.decode_pred_mode().unwrap();
        out.part_mode = adapter.decode_part_mode(&out).unwrap();
        adapter.decode_intra_dir_luma(&mut out, &neighbors).unwrap();
        adapter.decode_intra_dir_chroma(&mut out).unwrap();
        assert_eq!(out.part_mode, PartMode::PartNxN);
        assert_eq!(out.intra_luma_modes, cu.intra_luma_modes);
        assert_eq!(out.intra_chroma_mode, 0);
    }
}
