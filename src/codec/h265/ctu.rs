//! Coding unit data consumed by the residual pipeline
//!
//! A coding unit (CU) is a leaf of the CTU quadtree. It owns the prediction
//! decisions made by the (external) mode search and the few fields this
//! crate sets itself: the explicit-transform flag, the root CBF and the QP
//! after cu_qp_delta.
//!
//! CU sizes: 8×8 up to the CTB size (quadtree partitioning)
//! PU shapes: [`PartMode`], including asymmetric motion partitions
//! TU sizes: 4×4 up to 64×64 (see the `tu` module)

use crate::error::{Error, Result};

/// Prediction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredMode {
    /// Intra prediction (spatial prediction from neighboring blocks)
    #[default]
    Intra,
    /// Inter prediction (motion compensation from reference pictures)
    Inter,
}

/// Partition of a CU into prediction units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartMode {
    #[default]
    Part2Nx2N,
    Part2NxN,
    PartNx2N,
    PartNxN,
    Part2NxnU,
    Part2NxnD,
    PartnLx2N,
    PartnRx2N,
}

impl PartMode {
    /// Number of prediction units
    pub fn num_parts(&self) -> usize {
        match self {
            PartMode::Part2Nx2N => 1,
            PartMode::PartNxN => 4,
            _ => 2,
        }
    }

    /// True for the four asymmetric motion partitions
    pub fn is_amp(&self) -> bool {
        matches!(
            self,
            PartMode::Part2NxnU | PartMode::Part2NxnD | PartMode::PartnLx2N | PartMode::PartnRx2N
        )
    }

    /// True when prediction units are stacked vertically
    pub fn is_horizontal_split(&self) -> bool {
        matches!(self, PartMode::Part2NxN | PartMode::Part2NxnU | PartMode::Part2NxnD)
    }

    /// Width and height of prediction unit `part_idx` in a CU of size `1 << log2_cb`
    pub fn pu_size(&self, log2_cb: u8, part_idx: usize) -> (usize, usize) {
        let size = 1usize << log2_cb;
        let quarter = size / 4;
        match self {
            PartMode::Part2Nx2N => (size, size),
            PartMode::Part2NxN => (size, size / 2),
            PartMode::PartNx2N => (size / 2, size),
            PartMode::PartNxN => (size / 2, size / 2),
            PartMode::Part2NxnU => (size, if part_idx == 0 { quarter } else { size - quarter }),
            PartMode::Part2NxnD => (size, if part_idx == 0 { size - quarter } else { quarter }),
            PartMode::PartnLx2N => (if part_idx == 0 { quarter } else { size - quarter }, size),
            PartMode::PartnRx2N => (if part_idx == 0 { size - quarter } else { quarter }, size),
        }
    }
}

/// inter_pred_idc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterDir {
    #[default]
    L0,
    L1,
    Bi,
}

impl InterDir {
    /// True when list `list` (0 or 1) is used
    pub fn uses_list(&self, list: usize) -> bool {
        match self {
            InterDir::L0 => list == 0,
            InterDir::L1 => list == 1,
            InterDir::Bi => true,
        }
    }
}

/// Motion vector (difference) in quarter-sample units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mv {
    pub x: i32,
    pub y: i32,
}

impl Mv {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Motion data of one inter prediction unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PredictionUnit {
    pub merge_flag: bool,
    pub merge_idx: u8,
    pub inter_dir: InterDir,
    pub ref_idx: [u8; 2],
    pub mvd: [Mv; 2],
    pub mvp_idx: [u8; 2],
}

/// What the entropy adapter may read from an already coded neighboring CU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborCu {
    /// CU depth in the coding quadtree
    pub depth: u8,
    pub skip: bool,
    /// Luma intra mode of the adjacent PU, `None` for inter CUs
    pub intra_mode: Option<u8>,
    pub affine: bool,
    pub alf_flag: bool,
}

/// Left and above neighbors of a CU; `None` when unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CuNeighbors {
    pub left: Option<NeighborCu>,
    pub above: Option<NeighborCu>,
    /// False when the above CU lies in the CTU row above
    pub above_in_ctu: bool,
}

impl CuNeighbors {
    /// Count of available neighbors satisfying `pred`
    pub fn count(&self, pred: impl Fn(&NeighborCu) -> bool) -> usize {
        [self.left, self.above]
            .iter()
            .flatten()
            .filter(|n| pred(n))
            .count()
    }
}

/// Coding Unit (CU) - leaf node of CTU quadtree
#[derive(Debug, Clone, PartialEq)]
pub struct CodingUnit {
    /// Luma position in the picture (x in pixels)
    pub x: usize,
    /// Luma position in the picture (y in pixels)
    pub y: usize,
    /// Log2 of size
    pub log2_size: u8,
    /// Depth in the coding quadtree
    pub depth: u8,

    /// Prediction mode
    pub pred_mode: PredMode,
    /// Partition into prediction units
    pub part_mode: PartMode,
    /// Skip flag (inter, merge 2Nx2N without residual)
    pub skip: bool,
    /// Transquant bypass flag
    pub transquant_bypass: bool,

    /// Luma intra modes, one per PU (index 0 only for 2Nx2N)
    pub intra_luma_modes: [u8; 4],
    /// Derived chroma intra mode
    pub intra_chroma_mode: u8,
    /// Inter prediction units
    pub pus: Vec<PredictionUnit>,

    /// Affine motion flag
    pub affine: bool,
    /// OBMC flag
    pub obmc: bool,
    /// Explicit multiple transform flag
    pub emt_flag: bool,
    /// ALF on/off for this CU
    pub alf_flag: bool,
    /// rqt_root_cbf (true for intra)
    pub root_cbf: bool,
    /// QpY after cu_qp_delta
    pub qp: i32,
}

impl CodingUnit {
    /// Create a new intra coding unit
    pub fn new(x: usize, y: usize, log2_size: u8, depth: u8) -> Self {
        CodingUnit {
            x,
            y,
            log2_size,
            depth,
            pred_mode: PredMode::Intra,
            part_mode: PartMode::Part2Nx2N,
            skip: false,
            transquant_bypass: false,
            intra_luma_modes: [1; 4], // DC
            intra_chroma_mode: 1,
            pus: Vec::new(),
            affine: false,
            obmc: false,
            emt_flag: false,
            alf_flag: false,
            root_cbf: true,
            qp: 32,
        }
    }

    /// Inter CU with one default prediction unit per partition
    pub fn new_inter(x: usize, y: usize, log2_size: u8, depth: u8, part_mode: PartMode) -> Self {
        CodingUnit {
            pred_mode: PredMode::Inter,
            part_mode,
            pus: vec![PredictionUnit::default(); part_mode.num_parts()],
            ..Self::new(x, y, log2_size, depth)
        }
    }

    /// Size in luma samples
    pub fn size(&self) -> usize {
        1 << self.log2_size
    }

    /// Check if this CU can be split further
    pub fn can_split(&self, log2_min_cb: u8) -> bool {
        self.log2_size > log2_min_cb
    }

    pub fn is_intra(&self) -> bool {
        self.pred_mode == PredMode::Intra
    }

    /// Merge 2Nx2N inter CU (root CBF is then always coded except for skip)
    pub fn is_merge_2nx2n(&self) -> bool {
        self.pred_mode == PredMode::Inter
            && self.part_mode == PartMode::Part2Nx2N
            && self.pus.first().map(|pu| pu.merge_flag).unwrap_or(false)
    }

    /// Get the 4 sub-CUs if this CU is split (quadtree)
    pub fn split(&self) -> Result<[CodingUnit; 4]> {
        if self.log2_size <= 3 {
            return Err(Error::invalid_input(format!(
                "cannot split a {}x{} CU",
                self.size(),
                self.size()
            )));
        }
        let half = self.size() / 2;
        let child = |x, y| CodingUnit::new(x, y, self.log2_size - 1, self.depth + 1);
        Ok([
            // Top-left
            child(self.x, self.y),
            // Top-right
            child(self.x + half, self.y),
            // Bottom-left
            child(self.x, self.y + half),
            // Bottom-right
            child(self.x + half, self.y + half),
        ])
    }

    /// What later CUs see of this one
    pub fn as_neighbor(&self) -> NeighborCu {
        NeighborCu {
            depth: self.depth,
            skip: self.skip,
            intra_mode: if self.is_intra() {
                Some(self.intra_luma_modes[0])
            } else {
                None
            },
            affine: self.affine,
            alf_flag: self.alf_flag,
        }
    }
}
