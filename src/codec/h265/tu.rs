//! Transform tree of a coding unit
//!
//! The residual quadtree of a CU is kept in an arena ([`TransformTree`]) of
//! [`TuNode`]s addressed by [`TuId`]. Children are always allocated after
//! their parent, so walking the arena backwards visits every child before
//! its parent.
//!
//! Chroma placement follows the picture format:
//! - 4:4:4: every node carries its own chroma block of the luma size
//! - 4:2:0 / 4:2:2: chroma is half the luma width; when luma splits into 4x4
//!   leaves the chroma block stays with the 8x8 parent and is coded in the
//!   fourth leaf
//! - 4:2:2: each chroma block is twice as tall as wide and is coded as two
//!   stacked square sub-blocks, each with its own CBF

use super::config::{ChromaFormat, CodecConfig};
use super::ctu::{CodingUnit, PartMode};
use super::entropy::{chroma_mode_for_format, emt_cu_flag_present};
use super::residual::ResidualParams;
use super::sbac::{SymbolDecoder, SymbolEncoder};
use super::scan::ScanPattern;
use crate::error::{Error, Result};

/// Index of a node in a [`TransformTree`]
pub type TuId = usize;

/// Nonzero luma levels above which an intra TU signals its EMT index
pub const EMT_SIG_THRESHOLD: usize = 2;

/// One node of the residual quadtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuNode {
    /// Luma position in the picture
    pub x: usize,
    pub y: usize,
    /// log2 of the luma block size
    pub log2_size: u8,
    /// Transform depth relative to the CU
    pub depth: u8,
    /// Position among its siblings (z-order)
    pub blk_idx: u8,
    pub parent: Option<TuId>,
    pub children: Option<[TuId; 4]>,
    /// Coded block flags `[component][sub_block]`; sub-block 1 is only used
    /// by 4:2:2 chroma
    pub cbf: [[bool; 2]; 3],
    /// Levels in raster order; a 4:2:2 chroma entry holds both sub-blocks
    pub coeffs: [Vec<i32>; 3],
    pub transform_skip: [[bool; 2]; 3],
    /// EMT candidate index of the luma block
    pub emt_idx: u8,
}

impl TuNode {
    fn new(x: usize, y: usize, log2_size: u8, depth: u8, blk_idx: u8, parent: Option<TuId>) -> Self {
        Self {
            x,
            y,
            log2_size,
            depth,
            blk_idx,
            parent,
            children: None,
            cbf: [[false; 2]; 3],
            coeffs: Default::default(),
            transform_skip: [[false; 2]; 3],
            emt_idx: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Luma size in samples
    pub fn size(&self) -> usize {
        1 << self.log2_size
    }

    fn chroma_cbf_any(&self, c_idx: usize) -> bool {
        self.cbf[c_idx][0] || self.cbf[c_idx][1]
    }
}

/// Arena of transform nodes for one CU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformTree {
    nodes: Vec<TuNode>,
    format: ChromaFormat,
}

impl TransformTree {
    /// Unsplit tree covering `cu`
    pub fn new(cu: &CodingUnit, format: ChromaFormat) -> Self {
        Self {
            nodes: vec![TuNode::new(cu.x, cu.y, cu.log2_size, 0, 0, None)],
            format,
        }
    }

    pub fn root(&self) -> TuId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn format(&self) -> ChromaFormat {
        self.format
    }

    pub fn node(&self, id: TuId) -> &TuNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: TuId) -> &mut TuNode {
        &mut self.nodes[id]
    }

    /// Split a leaf into four quadrants
    pub fn split(&mut self, id: TuId) -> Result<[TuId; 4]> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::invalid_input(format!("no transform node {}", id)))?;
        if !node.is_leaf() {
            return Err(Error::invalid_input(format!("transform node {} is already split", id)));
        }
        if node.log2_size <= 2 {
            return Err(Error::invalid_input("cannot split a 4x4 transform block"));
        }
        let (x, y, log2, depth) = (node.x, node.y, node.log2_size - 1, node.depth + 1);
        let half = 1usize << log2;
        let first = self.nodes.len();
        for (i, (dx, dy)) in [(0, 0), (half, 0), (0, half), (half, half)].into_iter().enumerate() {
            self.nodes
                .push(TuNode::new(x + dx, y + dy, log2, depth, i as u8, Some(id)));
        }
        let children = [first, first + 1, first + 2, first + 3];
        self.nodes[id].children = Some(children);
        Ok(children)
    }

    /// Split every leaf shallower than `depth`
    pub fn split_to_depth(&mut self, depth: u8) -> Result<()> {
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            if self.nodes[id].depth >= depth {
                continue;
            }
            let children = match self.nodes[id].children {
                Some(children) => children,
                None => self.split(id)?,
            };
            stack.extend(children);
        }
        Ok(())
    }

    /// Leaves in coding order
    pub fn leaves(&self) -> Vec<TuId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            match self.nodes[id].children {
                Some(children) => stack.extend(children.iter().rev()),
                None => out.push(id),
            }
        }
        out
    }

    fn is_444(&self) -> bool {
        self.format == ChromaFormat::Yuv444
    }

    /// Chroma CBFs are signaled at nodes of this size
    fn codes_chroma_cbf(&self, log2_size: u8) -> bool {
        (log2_size > 2 && self.format.has_chroma()) || self.is_444()
    }

    /// Node whose chroma block covers `id`
    pub fn chroma_owner(&self, id: TuId) -> Option<TuId> {
        if !self.format.has_chroma() {
            return None;
        }
        let node = &self.nodes[id];
        if self.is_444() || node.log2_size > 2 {
            Some(id)
        } else {
            node.parent
        }
    }

    /// True when `id` stores chroma levels itself
    pub fn holds_chroma(&self, id: TuId) -> bool {
        if !self.format.has_chroma() {
            return false;
        }
        let node = &self.nodes[id];
        if node.is_leaf() {
            self.is_444() || node.log2_size > 2
        } else {
            !self.is_444() && node.log2_size == 3
        }
    }

    /// True when the chroma residual is coded in leaf `id`
    pub fn codes_chroma_in(&self, id: TuId) -> bool {
        let node = &self.nodes[id];
        match self.chroma_owner(id) {
            Some(owner) if owner == id => node.is_leaf(),
            Some(_) => node.blk_idx == 3,
            None => false,
        }
    }

    /// log2 of the (square) chroma block held by `owner`
    pub fn chroma_log2(&self, owner: TuId) -> u8 {
        let log2 = self.nodes[owner].log2_size;
        if self.is_444() {
            log2
        } else {
            log2 - 1
        }
    }

    /// Square chroma sub-blocks per chroma block
    pub fn chroma_sub_blocks(&self) -> usize {
        if self.format == ChromaFormat::Yuv422 {
            2
        } else {
            1
        }
    }

    /// Effective chroma CBF of component `c_idx` for leaf `id`
    pub fn chroma_cbf(&self, id: TuId, c_idx: usize) -> bool {
        self.chroma_owner(id)
            .map(|owner| self.nodes[owner].chroma_cbf_any(c_idx))
            .unwrap_or(false)
    }

    /// Store luma levels of leaf `id`
    pub fn set_luma(&mut self, id: TuId, coeffs: Vec<i32>) -> Result<()> {
        let node = &mut self.nodes[id];
        if coeffs.len() != node.size() * node.size() {
            return Err(Error::invalid_input(format!(
                "{} luma levels for a {}x{} block",
                coeffs.len(),
                node.size(),
                node.size()
            )));
        }
        node.coeffs[0] = coeffs;
        Ok(())
    }

    /// Store chroma levels of component `c_idx` on the node holding the chroma block of `id`
    pub fn set_chroma(&mut self, id: TuId, c_idx: usize, coeffs: Vec<i32>) -> Result<()> {
        let owner = self
            .chroma_owner(id)
            .ok_or_else(|| Error::invalid_input("monochrome tree has no chroma"))?;
        let side = 1usize << self.chroma_log2(owner);
        let expected = side * side * self.chroma_sub_blocks();
        if coeffs.len() != expected {
            return Err(Error::invalid_input(format!(
                "{} chroma levels, expected {}",
                coeffs.len(),
                expected
            )));
        }
        self.nodes[owner].coeffs[c_idx] = coeffs;
        Ok(())
    }

    /// Recompute every CBF from the stored levels
    pub fn update_cbfs(&mut self) {
        let sub_blocks = self.chroma_sub_blocks();
        for id in (0..self.nodes.len()).rev() {
            let holds_chroma = self.holds_chroma(id);
            let chroma_log2 = self.chroma_log2(id);
            let children = self.nodes[id].children;

            let mut cbf = [[false; 2]; 3];
            cbf[0][0] = match children {
                Some(ch) => ch.iter().any(|&c| self.nodes[c].cbf[0][0]),
                None => self.nodes[id].coeffs[0].iter().any(|&v| v != 0),
            };
            for c_idx in 1..3 {
                if holds_chroma {
                    let area = 1usize << (2 * chroma_log2);
                    let coeffs = &self.nodes[id].coeffs[c_idx];
                    for (sub, slot) in cbf[c_idx].iter_mut().enumerate().take(sub_blocks) {
                        *slot = coeffs
                            .get(sub * area..(sub + 1) * area)
                            .map_or(false, |s| s.iter().any(|&v| v != 0));
                    }
                } else if let Some(ch) = children {
                    cbf[c_idx][0] = ch.iter().any(|&c| self.nodes[c].chroma_cbf_any(c_idx));
                }
            }
            self.nodes[id].cbf = cbf;
        }
    }

    /// True when any block of the tree carries levels
    pub fn has_any_cbf(&self) -> bool {
        (0..self.nodes.len()).any(|id| {
            let node = &self.nodes[id];
            (node.is_leaf() && node.cbf[0][0])
                || (self.holds_chroma(id) && (node.chroma_cbf_any(1) || node.chroma_cbf_any(2)))
        })
    }

    fn propagate_luma_cbf(&mut self) {
        for id in (0..self.nodes.len()).rev() {
            if let Some(ch) = self.nodes[id].children {
                self.nodes[id].cbf[0][0] = ch.iter().any(|&c| self.nodes[c].cbf[0][0]);
            }
        }
    }
}

/// How split_transform_flag is obtained at a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitRule {
    /// The flag is coded
    Signaled,
    /// Inferred 1
    Forced,
    /// Inferred 0
    Forbidden,
}

/// Split rule for a node of `cu` at `log2_size` / `depth`
pub fn split_rule(config: &CodecConfig, cu: &CodingUnit, log2_size: u8, depth: u8) -> SplitRule {
    let intra_split = cu.is_intra() && cu.part_mode == PartMode::PartNxN;
    let max_depth = if cu.is_intra() {
        config.max_tu_depth_intra + intra_split as u8
    } else {
        config.max_tu_depth_inter
    };
    let inter_split = config.max_tu_depth_inter == 0
        && !cu.is_intra()
        && cu.part_mode != PartMode::Part2Nx2N
        && depth == 0;

    if log2_size > config.log2_max_tb_size || (intra_split && depth == 0) || inter_split {
        SplitRule::Forced
    } else if log2_size > config.log2_min_tb_size && depth < max_depth {
        SplitRule::Signaled
    } else {
        SplitRule::Forbidden
    }
}

/// Allowed cu_qp_delta range for the luma bit depth
pub fn cu_qp_delta_range(config: &CodecConfig) -> (i32, i32) {
    let offset = config.qp_bd_offset_luma();
    (-(26 + offset / 2), 25 + offset / 2)
}

/// QpY from the predicted QP and a decoded delta
pub fn apply_qp_delta(config: &CodecConfig, qp_pred: i32, delta: i32) -> i32 {
    let offset = config.qp_bd_offset_luma();
    (qp_pred + delta + 52 + 2 * offset).rem_euclid(52 + offset) - offset
}

/// Intra direction steering the luma block at (`x`, `y`), `None` for inter CUs
pub fn luma_intra_mode(cu: &CodingUnit, x: usize, y: usize) -> Option<u8> {
    cu.is_intra().then(|| {
        if cu.part_mode == PartMode::PartNxN {
            let half = cu.size() / 2;
            let idx = ((y - cu.y >= half) as usize) * 2 + (x - cu.x >= half) as usize;
            cu.intra_luma_modes[idx]
        } else {
            cu.intra_luma_modes[0]
        }
    })
}

/// Chroma intra direction after format mapping, `None` for inter CUs
pub fn chroma_intra_mode(config: &CodecConfig, cu: &CodingUnit) -> Option<u8> {
    cu.is_intra().then(|| {
        chroma_mode_for_format(
            cu.intra_chroma_mode,
            config.chroma_format,
            config.tools.num_intra_modes(),
        )
    })
}

/// Residual coding parameters of one block of `cu`
pub fn residual_params(
    config: &CodecConfig,
    cu: &CodingUnit,
    log2_size: u8,
    is_luma: bool,
    intra_mode: Option<u8>,
) -> ResidualParams {
    ResidualParams {
        log2_size,
        is_luma,
        scan: ScanPattern::select(
            intra_mode,
            log2_size,
            is_luma,
            config.chroma_format == ChromaFormat::Yuv444,
            config.tools.extended_intra_modes,
        ),
        sign_hiding: config.tools.sign_data_hiding && !cu.transquant_bypass,
    }
}

/// transform_skip_flag is coded for a block of this size
pub fn transform_skip_allowed(config: &CodecConfig, cu: &CodingUnit, log2_size: u8) -> bool {
    config.tools.transform_skip && !cu.transquant_bypass && log2_size == 2
}

/// Per-CU state shared by both directions
struct TuContext<'a> {
    config: &'a CodecConfig,
    emt_present: bool,
}

impl<'a> TuContext<'a> {
    fn new(config: &'a CodecConfig, cu: &CodingUnit) -> Self {
        Self {
            config,
            emt_present: emt_cu_flag_present(config, cu),
        }
    }

    fn transform_skip_allowed(&self, cu: &CodingUnit, log2_size: u8) -> bool {
        transform_skip_allowed(self.config, cu, log2_size)
    }

    fn luma_params(&self, cu: &CodingUnit, node: &TuNode) -> ResidualParams {
        let mode = luma_intra_mode(cu, node.x, node.y);
        residual_params(self.config, cu, node.log2_size, true, mode)
    }

    fn chroma_params(&self, cu: &CodingUnit, log2_size: u8) -> ResidualParams {
        let mode = chroma_intra_mode(self.config, cu);
        residual_params(self.config, cu, log2_size, false, mode)
    }
}

/// Nonzero levels of a block
pub fn count_nonzero(coeffs: &[i32]) -> usize {
    coeffs.iter().filter(|&&v| v != 0).count()
}

/// Levels of a block must agree with its CBF
fn check_block(cbf: bool, coeffs: &[i32], area: usize) -> Result<()> {
    if cbf {
        if coeffs.len() != area {
            return Err(Error::invalid_input(format!(
                "coded block has {} levels, expected {}",
                coeffs.len(),
                area
            )));
        }
        if coeffs.iter().all(|&v| v == 0) {
            return Err(Error::invalid_input("coded block flag set on an all-zero block"));
        }
    } else if coeffs.iter().any(|&v| v != 0) {
        return Err(Error::invalid_input("nonzero levels in a block without coded block flag"));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoder
// ─────────────────────────────────────────────────────────────────────────────

struct TuEncoder<'a, S: SymbolEncoder> {
    codec: &'a mut S,
    ctx: TuContext<'a>,
    cu: &'a CodingUnit,
    tree: &'a TransformTree,
    qp_pred: i32,
    qp_coded: bool,
    emt_coded: bool,
}

/// Write the transform tree of `cu`
///
/// CBFs are taken from the tree as stored; call
/// [`TransformTree::update_cbfs`] after filling in levels.
pub fn encode_transform_tree<S: SymbolEncoder>(
    codec: &mut S,
    config: &CodecConfig,
    cu: &CodingUnit,
    tree: &TransformTree,
    qp_pred: i32,
) -> Result<()> {
    let root = tree.node(tree.root());
    if root.log2_size != cu.log2_size || (root.x, root.y) != (cu.x, cu.y) {
        return Err(Error::invalid_input("transform tree does not cover the CU"));
    }
    if tree.format() != config.chroma_format {
        return Err(Error::invalid_input("transform tree chroma format differs from the configuration"));
    }
    if !cu.is_intra() && !tree.has_any_cbf() {
        return Err(Error::invalid_input("inter CU with rqt_root_cbf has no coded block"));
    }

    let mut walker = TuEncoder {
        codec,
        ctx: TuContext::new(config, cu),
        cu,
        tree,
        qp_pred,
        qp_coded: false,
        emt_coded: false,
    };
    walker.encode_node(tree.root())
}

impl<'a, S: SymbolEncoder> TuEncoder<'a, S> {
    fn encode_node(&mut self, id: TuId) -> Result<()> {
        let tree = self.tree;
        let node = tree.node(id);
        let split = !node.is_leaf();

        match split_rule(self.ctx.config, self.cu, node.log2_size, node.depth) {
            SplitRule::Signaled => self.codec.encode_split_transform_flag(split, node.log2_size),
            SplitRule::Forced if !split => {
                return Err(Error::invalid_input(format!(
                    "{}x{} transform block at depth {} must be split",
                    node.size(),
                    node.size(),
                    node.depth
                )));
            }
            SplitRule::Forbidden if split => {
                return Err(Error::invalid_input(format!(
                    "{}x{} transform block at depth {} cannot be split",
                    node.size(),
                    node.size(),
                    node.depth
                )));
            }
            _ => {}
        }

        if tree.codes_chroma_cbf(node.log2_size) {
            let second = tree.format() == ChromaFormat::Yuv422 && (!split || node.log2_size == 3);
            for c_idx in 1..3 {
                let parent_cbf = node
                    .parent
                    .map_or(true, |p| tree.node(p).chroma_cbf_any(c_idx));
                if parent_cbf {
                    self.codec.encode_cbf(node.cbf[c_idx][0], false, node.depth);
                    if second {
                        self.codec.encode_cbf(node.cbf[c_idx][1], false, node.depth);
                    }
                } else if node.chroma_cbf_any(c_idx) {
                    return Err(Error::invalid_input("chroma CBF set below a zero parent CBF"));
                }
            }
        }

        if let Some(children) = node.children {
            for child in children {
                self.encode_node(child)?;
            }
            return Ok(());
        }

        let luma_cbf = node.cbf[0][0];
        if self.cu.is_intra() || node.depth != 0 || node.chroma_cbf_any(1) || node.chroma_cbf_any(2) {
            self.codec.encode_cbf(luma_cbf, true, node.depth);
        } else if !luma_cbf {
            return Err(Error::invalid_input(
                "inter root TU without chroma residual must carry luma residual",
            ));
        }
        self.encode_unit(id)
    }

    fn encode_unit(&mut self, id: TuId) -> Result<()> {
        let tree = self.tree;
        let node = tree.node(id);
        let cbf_chroma = tree.chroma_cbf(id, 1) || tree.chroma_cbf(id, 2);
        let luma_cbf = node.cbf[0][0];
        if !luma_cbf && !cbf_chroma {
            return check_block(false, &node.coeffs[0], 0);
        }

        if self.ctx.config.tools.cu_qp_delta && !self.qp_coded {
            let delta = self.cu.qp - self.qp_pred;
            let (lo, hi) = cu_qp_delta_range(self.ctx.config);
            if delta < lo || delta > hi {
                return Err(Error::invalid_input(format!(
                    "cu_qp_delta {} out of range {}..={}",
                    delta, lo, hi
                )));
            }
            self.codec.encode_cu_qp_delta(delta);
            self.qp_coded = true;
        }

        let area = node.size() * node.size();
        check_block(luma_cbf, &node.coeffs[0], area)?;
        if luma_cbf {
            self.encode_luma(node)?;
        } else if node.emt_idx != 0 || node.transform_skip[0][0] {
            return Err(Error::invalid_input("luma transform options on an uncoded block"));
        }

        if tree.codes_chroma_in(id) {
            if let Some(owner) = tree.chroma_owner(id) {
                self.encode_chroma(owner)?;
            }
        }
        Ok(())
    }

    fn encode_luma(&mut self, node: &TuNode) -> Result<()> {
        let cu = self.cu;
        if self.ctx.emt_present && !self.emt_coded {
            self.codec.encode_emt_cu_flag(cu.emt_flag, cu.depth);
            self.emt_coded = true;
        }
        let emt = self.ctx.emt_present && cu.emt_flag;

        if self.ctx.transform_skip_allowed(cu, node.log2_size) && !emt {
            self.codec.encode_transform_skip_flag(node.transform_skip[0][0], true);
        } else if node.transform_skip[0][0] {
            return Err(Error::invalid_input("transform skip not allowed for this luma block"));
        }

        let params = self.ctx.luma_params(cu, node);
        self.codec.encode_residual(&params, &node.coeffs[0]);

        let idx_coded = emt && (!cu.is_intra() || count_nonzero(&node.coeffs[0]) > EMT_SIG_THRESHOLD);
        if idx_coded {
            self.codec.encode_emt_tu_idx(node.emt_idx, cu.is_intra());
        } else if node.emt_idx != 0 {
            return Err(Error::invalid_input("EMT index would not be signaled for this block"));
        }
        Ok(())
    }

    fn encode_chroma(&mut self, owner: TuId) -> Result<()> {
        let tree = self.tree;
        let node = tree.node(owner);
        let log2 = tree.chroma_log2(owner);
        let area = 1usize << (2 * log2);
        let params = self.ctx.chroma_params(self.cu, log2);
        let ts_allowed = self.ctx.transform_skip_allowed(self.cu, log2);

        for c_idx in 1..3 {
            let coeffs = &node.coeffs[c_idx];
            for sub in 0..tree.chroma_sub_blocks() {
                let cbf = node.cbf[c_idx][sub];
                let block = coeffs.get(sub * area..(sub + 1) * area).unwrap_or(&[]);
                check_block(cbf, block, area)?;
                if !cbf {
                    continue;
                }
                if ts_allowed {
                    self.codec
                        .encode_transform_skip_flag(node.transform_skip[c_idx][sub], false);
                } else if node.transform_skip[c_idx][sub] {
                    return Err(Error::invalid_input("transform skip not allowed for this chroma block"));
                }
                self.codec.encode_residual(&params, block);
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoder
// ─────────────────────────────────────────────────────────────────────────────

struct TuDecoder<'a, S: SymbolDecoder> {
    codec: &'a mut S,
    ctx: TuContext<'a>,
    cu: &'a mut CodingUnit,
    tree: TransformTree,
    qp_pred: i32,
    qp_coded: bool,
    emt_coded: bool,
}

/// Parse the transform tree of `cu`, setting its QP and EMT flag
pub fn decode_transform_tree<S: SymbolDecoder>(
    codec: &mut S,
    config: &CodecConfig,
    cu: &mut CodingUnit,
    qp_pred: i32,
) -> Result<TransformTree> {
    cu.qp = qp_pred;
    cu.emt_flag = false;
    let tree = TransformTree::new(cu, config.chroma_format);
    let ctx = TuContext::new(config, cu);

    let mut walker = TuDecoder {
        codec,
        ctx,
        cu,
        tree,
        qp_pred,
        qp_coded: false,
        emt_coded: false,
    };
    let root = walker.tree.root();
    walker.decode_node(root)?;

    let mut tree = walker.tree;
    tree.propagate_luma_cbf();
    if !walker.cu.is_intra() && !tree.has_any_cbf() {
        tracing::warn!(
            "inter CU at ({}, {}) signals residual but codes no block",
            walker.cu.x,
            walker.cu.y
        );
        return Err(Error::conformance("rqt_root_cbf set without any coded block"));
    }
    tracing::trace!(nodes = tree.len(), qp = walker.cu.qp, "transform tree parsed");
    Ok(tree)
}

impl<'a, S: SymbolDecoder> TuDecoder<'a, S> {
    fn decode_node(&mut self, id: TuId) -> Result<()> {
        let (log2, depth, parent) = {
            let node = self.tree.node(id);
            (node.log2_size, node.depth, node.parent)
        };
        let split = match split_rule(self.ctx.config, self.cu, log2, depth) {
            SplitRule::Signaled => self.codec.decode_split_transform_flag(log2)?,
            SplitRule::Forced => true,
            SplitRule::Forbidden => false,
        };

        let mut cbf = [[false; 2]; 3];
        if self.tree.codes_chroma_cbf(log2) {
            let second = self.tree.format() == ChromaFormat::Yuv422 && (!split || log2 == 3);
            for c_idx in 1..3 {
                let parent_cbf = parent.map_or(true, |p| self.tree.node(p).chroma_cbf_any(c_idx));
                if parent_cbf {
                    cbf[c_idx][0] = self.codec.decode_cbf(false, depth)?;
                    if second {
                        cbf[c_idx][1] = self.codec.decode_cbf(false, depth)?;
                    }
                }
            }
        }
        self.tree.node_mut(id).cbf = cbf;
        tracing::trace!(log2, depth, split, cbf_cb = ?cbf[1], cbf_cr = ?cbf[2], "transform node");

        if split {
            let children = self.tree.split(id).map_err(|e| {
                tracing::warn!("impossible transform split: {}", e);
                Error::conformance(format!("transform split at log2 size {} not permitted", log2))
            })?;
            for child in children {
                self.decode_node(child)?;
            }
            return Ok(());
        }

        let chroma_here = cbf[1][0] || cbf[1][1] || cbf[2][0] || cbf[2][1];
        let luma_cbf = if self.cu.is_intra() || depth != 0 || chroma_here {
            self.codec.decode_cbf(true, depth)?
        } else {
            true
        };
        self.tree.node_mut(id).cbf[0][0] = luma_cbf;
        self.decode_unit(id)
    }

    fn decode_unit(&mut self, id: TuId) -> Result<()> {
        let luma_cbf = self.tree.node(id).cbf[0][0];
        let cbf_chroma = self.tree.chroma_cbf(id, 1) || self.tree.chroma_cbf(id, 2);
        if !luma_cbf && !cbf_chroma {
            return Ok(());
        }

        if self.ctx.config.tools.cu_qp_delta && !self.qp_coded {
            let delta = self.codec.decode_cu_qp_delta()?;
            let (lo, hi) = cu_qp_delta_range(self.ctx.config);
            if delta < lo || delta > hi {
                tracing::warn!("cu_qp_delta {} outside {}..={}", delta, lo, hi);
                return Err(Error::conformance(format!("cu_qp_delta {} out of range", delta)));
            }
            self.cu.qp = apply_qp_delta(self.ctx.config, self.qp_pred, delta);
            self.qp_coded = true;
        }

        if luma_cbf {
            self.decode_luma(id)?;
        }
        if self.tree.codes_chroma_in(id) {
            if let Some(owner) = self.tree.chroma_owner(id) {
                self.decode_chroma(owner)?;
            }
        }
        Ok(())
    }

    fn decode_luma(&mut self, id: TuId) -> Result<()> {
        if self.ctx.emt_present && !self.emt_coded {
            self.cu.emt_flag = self.codec.decode_emt_cu_flag(self.cu.depth)?;
            self.emt_coded = true;
        }
        let emt = self.ctx.emt_present && self.cu.emt_flag;
        let log2 = self.tree.node(id).log2_size;

        let transform_skip = if self.ctx.transform_skip_allowed(self.cu, log2) && !emt {
            self.codec.decode_transform_skip_flag(true)?
        } else {
            false
        };

        let params = self.ctx.luma_params(self.cu, self.tree.node(id));
        let mut coeffs = vec![0i32; 1 << (2 * log2)];
        self.codec.decode_residual(&params, &mut coeffs)?;

        let idx_coded = emt && (!self.cu.is_intra() || count_nonzero(&coeffs) > EMT_SIG_THRESHOLD);
        let emt_idx = if idx_coded {
            self.codec.decode_emt_tu_idx(self.cu.is_intra())?
        } else {
            0
        };

        let node = self.tree.node_mut(id);
        node.transform_skip[0][0] = transform_skip;
        node.coeffs[0] = coeffs;
        node.emt_idx = emt_idx;
        Ok(())
    }

    fn decode_chroma(&mut self, owner: TuId) -> Result<()> {
        let log2 = self.tree.chroma_log2(owner);
        let area = 1usize << (2 * log2);
        let sub_blocks = self.tree.chroma_sub_blocks();
        let params = self.ctx.chroma_params(self.cu, log2);
        let ts_allowed = self.ctx.transform_skip_allowed(self.cu, log2);

        for c_idx in 1..3 {
            let cbf = self.tree.node(owner).cbf[c_idx];
            let mut coeffs = vec![0i32; area * sub_blocks];
            let mut skip = [false; 2];
            for sub in 0..sub_blocks {
                if !cbf[sub] {
                    continue;
                }
                if ts_allowed {
                    skip[sub] = self.codec.decode_transform_skip_flag(false)?;
                }
                self.codec
                    .decode_residual(&params, &mut coeffs[sub * area..(sub + 1) * area])?;
            }
            let node = self.tree.node_mut(owner);
            node.coeffs[c_idx] = coeffs;
            node.transform_skip[c_idx] = skip;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::cabac::{CabacReader, CabacWriter};
    use crate::codec::h265::config::SliceType;
    use crate::codec::h265::sbac::Sbac;

    fn block(area: usize, seed: i32) -> Vec<i32> {
        let mut v = vec![0; area];
        v[0] = seed;
        v
    }

    fn roundtrip(config: &CodecConfig, cu: &CodingUnit, tree: &TransformTree, qp_pred: i32) -> (CodingUnit, TransformTree) {
        let mut enc = Sbac::new(CabacWriter::new(), SliceType::B, 30);
        encode_transform_tree(&mut enc, config, cu, tree, qp_pred).unwrap();
        enc.encode_end_of_slice_segment_flag(true);
        let data = enc.into_inner().finish();

        let mut dec = Sbac::new(CabacReader::new(&data).unwrap(), SliceType::B, 30);
        let mut out = cu.clone();
        let decoded = decode_transform_tree(&mut dec, config, &mut out, qp_pred).unwrap();
        assert!(dec.decode_end_of_slice_segment_flag().unwrap());
        (out, decoded)
    }

    fn assert_same_leaves(a: &TransformTree, b: &TransformTree) {
        assert_eq!(a.leaves(), b.leaves());
        for id in a.leaves() {
            assert_eq!(a.node(id).cbf[0][0], b.node(id).cbf[0][0]);
            if a.node(id).cbf[0][0] {
                assert_eq!(a.node(id).coeffs[0], b.node(id).coeffs[0]);
            }
            for c in 1..3 {
                assert_eq!(a.chroma_cbf(id, c), b.chroma_cbf(id, c));
            }
        }
    }

    #[test]
    fn test_split_rules() {
        let config = CodecConfig::hevc_main();
        let intra = CodingUnit::new(0, 0, 6, 0);
        assert_eq!(split_rule(&config, &intra, 6, 0), SplitRule::Forced);
        assert_eq!(split_rule(&config, &intra, 5, 1), SplitRule::Forbidden);

        let cu = CodingUnit::new(0, 0, 4, 0);
        assert_eq!(split_rule(&config, &cu, 4, 0), SplitRule::Signaled);

        let mut nxn = CodingUnit::new(0, 0, 3, 0);
        nxn.part_mode = PartMode::PartNxN;
        assert_eq!(split_rule(&config, &nxn, 3, 0), SplitRule::Forced);
        assert_eq!(split_rule(&config, &nxn, 2, 1), SplitRule::Forbidden);

        let mut config0 = config.clone();
        config0.max_tu_depth_inter = 0;
        let inter = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2NxN);
        assert_eq!(split_rule(&config0, &inter, 4, 0), SplitRule::Forced);
        let inter = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2Nx2N);
        assert_eq!(split_rule(&config0, &inter, 4, 0), SplitRule::Forbidden);
    }

    #[test]
    fn test_qp_delta_wraps() {
        let config = CodecConfig::hevc_main();
        assert_eq!(apply_qp_delta(&config, 30, 4), 34);
        assert_eq!(apply_qp_delta(&config, 50, 3), 1);
        assert_eq!(apply_qp_delta(&config, 1, -3), 50);
        assert_eq!(cu_qp_delta_range(&config), (-26, 25));
    }

    #[test]
    fn test_chroma_ownership_420() {
        let cu = CodingUnit::new(0, 0, 3, 0);
        let mut tree = TransformTree::new(&cu, ChromaFormat::Yuv420);
        let children = tree.split(tree.root()).unwrap();
        assert!(tree.holds_chroma(tree.root()));
        assert_eq!(tree.chroma_owner(children[0]), Some(tree.root()));
        assert!(!tree.codes_chroma_in(children[0]));
        assert!(tree.codes_chroma_in(children[3]));
        assert_eq!(tree.chroma_log2(tree.root()), 2);
        assert_eq!(tree.leaves(), children.to_vec());
    }

    #[test]
    fn test_intra_split_tree_roundtrip() {
        let config = CodecConfig::hevc_main();
        let mut cu = CodingUnit::new(16, 16, 4, 1);
        cu.intra_luma_modes = [10; 4];
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        let children = tree.split(tree.root()).unwrap();
        tree.set_luma(children[0], block(64, 3)).unwrap();
        tree.set_luma(children[3], block(64, -7)).unwrap();
        tree.set_chroma(children[1], 1, block(16, 2)).unwrap();
        tree.set_chroma(children[2], 2, vec![0; 16]).unwrap();
        tree.update_cbfs();
        assert!(tree.node(tree.root()).cbf[1][0]);
        assert!(!tree.node(tree.root()).cbf[2][0]);

        let (_, decoded) = roundtrip(&config, &cu, &tree, 30);
        assert_same_leaves(&tree, &decoded);
        assert_eq!(decoded.node(children[1]).coeffs[1], block(16, 2));
    }

    #[test]
    fn test_nxn_4x4_chroma_in_last_leaf() {
        let config = CodecConfig::hevc_main();
        let mut cu = CodingUnit::new(0, 0, 3, 3);
        cu.part_mode = PartMode::PartNxN;
        cu.intra_luma_modes = [26, 10, 0, 1];
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        let children = tree.split(tree.root()).unwrap();
        for (i, &child) in children.iter().enumerate() {
            tree.set_luma(child, block(16, i as i32 + 1)).unwrap();
        }
        tree.set_chroma(children[0], 1, block(16, 4)).unwrap();
        tree.set_chroma(children[0], 2, block(16, -4)).unwrap();
        tree.update_cbfs();

        let (_, decoded) = roundtrip(&config, &cu, &tree, 30);
        assert_same_leaves(&tree, &decoded);
        assert_eq!(decoded.node(decoded.root()).coeffs[2], block(16, -4));
    }

    #[test]
    fn test_422_sub_block_cbfs() {
        let mut config = CodecConfig::hevc_main();
        config.chroma_format = ChromaFormat::Yuv422;
        let cu = CodingUnit::new(0, 0, 4, 0);
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        tree.set_luma(tree.root(), vec![0; 256]).unwrap();
        let mut cb = vec![0; 128];
        cb[64] = 9;
        tree.set_chroma(tree.root(), 1, cb.clone()).unwrap();
        tree.update_cbfs();
        assert_eq!(tree.node(tree.root()).cbf[1], [false, true]);

        let (_, decoded) = roundtrip(&config, &cu, &tree, 30);
        assert_eq!(decoded.node(decoded.root()).cbf[1], [false, true]);
        assert_eq!(decoded.node(decoded.root()).coeffs[1], cb);
        assert!(!decoded.node(decoded.root()).cbf[0][0]);
    }

    #[test]
    fn test_qp_delta_coded_once() {
        let mut config = CodecConfig::hevc_main();
        config.tools.cu_qp_delta = true;
        let mut cu = CodingUnit::new(0, 0, 4, 0);
        cu.qp = 27;
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        let children = tree.split(tree.root()).unwrap();
        for &child in &children {
            tree.set_luma(child, block(64, 2)).unwrap();
        }
        tree.update_cbfs();

        let (decoded_cu, _) = roundtrip(&config, &cu, &tree, 32);
        assert_eq!(decoded_cu.qp, 27);
    }

    #[test]
    fn test_emt_flags_roundtrip() {
        let config = CodecConfig::extended();
        let mut cu = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2Nx2N);
        cu.emt_flag = true;
        let mut tree = TransformTree::new(&cu, config.chroma_format);
        tree.set_luma(tree.root(), block(256, 11)).unwrap();
        tree.node_mut(0).emt_idx = 2;
        tree.update_cbfs();

        let (decoded_cu, decoded) = roundtrip(&config, &cu, &tree, 32);
        assert!(decoded_cu.emt_flag);
        assert_eq!(decoded.node(0).emt_idx, 2);
    }

    #[test]
    fn test_encoder_rejects_inconsistent_trees() {
        let config = CodecConfig::hevc_main();
        let cu = CodingUnit::new_inter(0, 0, 4, 0, PartMode::Part2Nx2N);
        let mut enc = Sbac::new(CabacWriter::new(), SliceType::B, 30);

        let empty = TransformTree::new(&cu, config.chroma_format);
        assert!(encode_transform_tree(&mut enc, &config, &cu, &empty, 30).is_err());

        let mut stale = TransformTree::new(&cu, config.chroma_format);
        stale.set_luma(0, block(256, 1)).unwrap();
        stale.node_mut(0).cbf[0][0] = false;
        stale.node_mut(0).cbf[1][0] = true;
        stale.set_chroma(0, 1, block(64, 1)).unwrap();
        assert!(encode_transform_tree(&mut enc, &config, &cu, &stale, 30).is_err());
    }
}
