//! Context model layout and initialization tables
//!
//! Every syntax element that uses context-coded bins owns a fixed slice of
//! [`ContextModel`]s inside a [`ContextSet`]. Init values are listed per
//! slice type in the order B, P, I. Elements that are never context coded
//! in a slice type carry the neutral value 154 there.
//!
//! A `ContextSet` is plain data: cloning it is how wavefront and tile
//! entry points save and restore probability state.

use super::cabac::ContextModel;
use super::config::SliceType;

/// Neutral init value (equiprobable at every QP)
const CNU: u8 = 154;

/// Luma contexts for last_sig_coeff_{x,y}_prefix
pub const NUM_LAST_CTX_LUMA: usize = 20;
/// Total last-position contexts per dimension (luma then chroma)
pub const NUM_LAST_CTX: usize = NUM_LAST_CTX_LUMA + 3;
/// sig_coeff_flag contexts for luma; chroma contexts follow
pub const NUM_SIG_CTX_LUMA: usize = 27;
/// gt1 contexts for luma; chroma contexts follow
pub const NUM_GT1_CTX_LUMA: usize = 16;
/// gt2 contexts for luma; chroma contexts follow
pub const NUM_GT2_CTX_LUMA: usize = 4;

const SPLIT_CU_FLAG: [[u8; 3]; 3] = [[107, 139, 126], [107, 139, 126], [139, 141, 157]];
const CU_TRANSQUANT_BYPASS_FLAG: [[u8; 1]; 3] = [[154], [154], [154]];
const CU_SKIP_FLAG: [[u8; 3]; 3] = [[197, 185, 201], [197, 185, 201], [CNU, CNU, CNU]];
const MERGE_FLAG: [[u8; 1]; 3] = [[154], [110], [CNU]];
const MERGE_IDX: [[u8; 1]; 3] = [[137], [122], [CNU]];
const PRED_MODE_FLAG: [[u8; 1]; 3] = [[134], [149], [CNU]];
const PART_MODE: [[u8; 4]; 3] = [[154, 139, 154, 154], [154, 139, 154, 154], [184, CNU, CNU, CNU]];
const PREV_INTRA_LUMA_PRED_FLAG: [[u8; 1]; 3] = [[183], [154], [184]];
const MPM_IDX: [[u8; 3]; 3] = [[CNU, CNU, CNU], [CNU, CNU, CNU], [CNU, CNU, CNU]];
const INTRA_CHROMA_PRED_MODE: [[u8; 1]; 3] = [[152], [152], [63]];
const INTER_PRED_IDC: [[u8; 5]; 3] = [[95, 79, 63, 31, 31], [95, 79, 63, 31, 31], [CNU; 5]];
const REF_IDX: [[u8; 2]; 3] = [[153, 153], [153, 153], [CNU, CNU]];
const MVD: [[u8; 2]; 3] = [[169, 198], [140, 198], [CNU, CNU]];
const MVP_IDX: [[u8; 1]; 3] = [[168], [168], [CNU]];
const RQT_ROOT_CBF: [[u8; 1]; 3] = [[79], [79], [CNU]];
const SPLIT_TRANSFORM_FLAG: [[u8; 3]; 3] = [[224, 167, 122], [124, 138, 94], [153, 138, 138]];
const CBF_LUMA: [[u8; 2]; 3] = [[153, 111], [153, 111], [111, 141]];
const CBF_CHROMA: [[u8; 5]; 3] = [
    [149, 92, 167, 154, 154],
    [149, 107, 167, 154, 154],
    [94, 138, 182, 154, 154],
];
const CU_QP_DELTA_ABS: [[u8; 2]; 3] = [[154, 154], [154, 154], [154, 154]];
const TRANSFORM_SKIP_FLAG: [[u8; 2]; 3] = [[139, 139], [139, 139], [139, 139]];
const CODED_SUB_BLOCK_FLAG: [[u8; 4]; 3] = [[121, 140, 61, 154], [121, 140, 61, 154], [91, 171, 134, 141]];

const LAST_PREFIX: [[u8; NUM_LAST_CTX]; 3] = [
    [
        125, 110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111, 79, CNU, CNU, CNU,
        CNU, CNU, 108, 123, 93,
    ],
    [
        125, 110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95, 94, CNU, CNU, CNU, CNU,
        CNU, 108, 123, 108,
    ],
    [
        110, 110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111, 79, CNU, CNU, CNU,
        CNU, CNU, 108, 123, 63,
    ],
];

const SIG_COEFF_FLAG: [[u8; 42]; 3] = [
    [
        170, 154, 139, 153, 139, 123, 123, 63, 124, 166, 183, 140, 136, 153, 154, 166, 183, 140,
        136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 138, 138, 122, 121, 122, 121, 167,
        151, 183, 140, 151, 183, 140,
    ],
    [
        155, 154, 139, 153, 139, 123, 123, 63, 153, 166, 183, 140, 136, 153, 154, 166, 183, 140,
        136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 123, 123, 107, 121, 107, 121, 167,
        151, 183, 140, 151, 183, 140,
    ],
    [
        111, 111, 125, 110, 110, 94, 124, 108, 124, 107, 125, 141, 179, 153, 125, 107, 125, 141,
        179, 153, 125, 107, 125, 141, 179, 153, 125, 140, 139, 182, 182, 152, 136, 152, 136, 153,
        136, 139, 111, 136, 139, 111,
    ],
];

const GT1_FLAG: [[u8; 24]; 3] = [
    [
        154, 196, 167, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 137, 169, 194,
        166, 167, 154, 167, 137, 182,
    ],
    [
        154, 196, 196, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 122, 169, 208,
        166, 167, 154, 152, 167, 182,
    ],
    [
        140, 92, 137, 138, 140, 152, 138, 139, 153, 74, 149, 92, 139, 107, 122, 152, 140, 179,
        166, 182, 140, 227, 122, 197,
    ],
];

const GT2_FLAG: [[u8; 6]; 3] = [
    [107, 167, 91, 107, 107, 167],
    [107, 167, 91, 122, 107, 167],
    [138, 153, 136, 167, 152, 152],
];

const EMT_CU_FLAG: [[u8; 4]; 3] = [[CNU; 4], [CNU; 4], [CNU; 4]];
const EMT_TU_IDX: [[u8; 4]; 3] = [[CNU; 4], [CNU; 4], [CNU; 4]];
const AFFINE_FLAG: [[u8; 3]; 3] = [[197, 185, 201], [197, 185, 201], [CNU, CNU, CNU]];
const OBMC_FLAG: [[u8; 1]; 3] = [[201], [201], [CNU]];
const ALF_CTRL_FLAG: [[u8; 3]; 3] = [[CNU; 3], [CNU; 3], [CNU; 3]];

fn init_row<const N: usize>(table: &[[u8; N]; 3], slice_type: SliceType, qp: i32) -> [ContextModel; N] {
    let row = &table[slice_type.init_row()];
    let mut out = [ContextModel::default(); N];
    for (ctx, &init_value) in out.iter_mut().zip(row.iter()) {
        *ctx = ContextModel::init(init_value, qp);
    }
    out
}

/// All context models of one slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSet {
    pub split_cu_flag: [ContextModel; 3],
    pub cu_transquant_bypass_flag: [ContextModel; 1],
    pub cu_skip_flag: [ContextModel; 3],
    pub merge_flag: [ContextModel; 1],
    pub merge_idx: [ContextModel; 1],
    pub pred_mode_flag: [ContextModel; 1],
    pub part_mode: [ContextModel; 4],
    pub prev_intra_luma_pred_flag: [ContextModel; 1],
    pub mpm_idx: [ContextModel; 3],
    pub intra_chroma_pred_mode: [ContextModel; 1],
    pub inter_pred_idc: [ContextModel; 5],
    pub ref_idx: [ContextModel; 2],
    pub mvd: [ContextModel; 2],
    pub mvp_idx: [ContextModel; 1],
    pub rqt_root_cbf: [ContextModel; 1],
    pub split_transform_flag: [ContextModel; 3],
    pub cbf_luma: [ContextModel; 2],
    pub cbf_chroma: [ContextModel; 5],
    pub cu_qp_delta_abs: [ContextModel; 2],
    pub transform_skip_flag: [ContextModel; 2],
    pub last_x_prefix: [ContextModel; NUM_LAST_CTX],
    pub last_y_prefix: [ContextModel; NUM_LAST_CTX],
    pub coded_sub_block_flag: [ContextModel; 4],
    pub sig_coeff_flag: [ContextModel; 42],
    pub gt1_flag: [ContextModel; 24],
    pub gt2_flag: [ContextModel; 6],
    pub emt_cu_flag: [ContextModel; 4],
    pub emt_tu_idx: [ContextModel; 4],
    pub affine_flag: [ContextModel; 3],
    pub obmc_flag: [ContextModel; 1],
    pub alf_ctrl_flag: [ContextModel; 3],
}

impl ContextSet {
    /// Initialize every context for a slice
    pub fn new(slice_type: SliceType, qp: i32) -> Self {
        Self {
            split_cu_flag: init_row(&SPLIT_CU_FLAG, slice_type, qp),
            cu_transquant_bypass_flag: init_row(&CU_TRANSQUANT_BYPASS_FLAG, slice_type, qp),
            cu_skip_flag: init_row(&CU_SKIP_FLAG, slice_type, qp),
            merge_flag: init_row(&MERGE_FLAG, slice_type, qp),
            merge_idx: init_row(&MERGE_IDX, slice_type, qp),
            pred_mode_flag: init_row(&PRED_MODE_FLAG, slice_type, qp),
            part_mode: init_row(&PART_MODE, slice_type, qp),
            prev_intra_luma_pred_flag: init_row(&PREV_INTRA_LUMA_PRED_FLAG, slice_type, qp),
            mpm_idx: init_row(&MPM_IDX, slice_type, qp),
            intra_chroma_pred_mode: init_row(&INTRA_CHROMA_PRED_MODE, slice_type, qp),
            inter_pred_idc: init_row(&INTER_PRED_IDC, slice_type, qp),
            ref_idx: init_row(&REF_IDX, slice_type, qp),
            mvd: init_row(&MVD, slice_type, qp),
            mvp_idx: init_row(&MVP_IDX, slice_type, qp),
            rqt_root_cbf: init_row(&RQT_ROOT_CBF, slice_type, qp),
            split_transform_flag: init_row(&SPLIT_TRANSFORM_FLAG, slice_type, qp),
            cbf_luma: init_row(&CBF_LUMA, slice_type, qp),
            cbf_chroma: init_row(&CBF_CHROMA, slice_type, qp),
            cu_qp_delta_abs: init_row(&CU_QP_DELTA_ABS, slice_type, qp),
            transform_skip_flag: init_row(&TRANSFORM_SKIP_FLAG, slice_type, qp),
            last_x_prefix: init_row(&LAST_PREFIX, slice_type, qp),
            last_y_prefix: init_row(&LAST_PREFIX, slice_type, qp),
            coded_sub_block_flag: init_row(&CODED_SUB_BLOCK_FLAG, slice_type, qp),
            sig_coeff_flag: init_row(&SIG_COEFF_FLAG, slice_type, qp),
            gt1_flag: init_row(&GT1_FLAG, slice_type, qp),
            gt2_flag: init_row(&GT2_FLAG, slice_type, qp),
            emt_cu_flag: init_row(&EMT_CU_FLAG, slice_type, qp),
            emt_tu_idx: init_row(&EMT_TU_IDX, slice_type, qp),
            affine_flag: init_row(&AFFINE_FLAG, slice_type, qp),
            obmc_flag: init_row(&OBMC_FLAG, slice_type, qp),
            alf_ctrl_flag: init_row(&ALF_CTRL_FLAG, slice_type, qp),
        }
    }

    /// Copy of the current state for a later [`ContextSet::restore`]
    pub fn snapshot(&self) -> ContextSet {
        self.clone()
    }

    /// Replace the current state with a saved one
    pub fn restore(&mut self, saved: &ContextSet) {
        self.clone_from(saved);
    }
}
