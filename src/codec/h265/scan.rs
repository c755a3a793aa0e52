//! Coefficient scan orders
//!
//! Coefficients are coded in 4x4 coefficient groups (CGs). A block scan is
//! the CG scan at group granularity with the 4x4 scan of the same type
//! inside each group. Three scan types exist:
//!
//! - **Diagonal**: up-right diagonal, starting at the bottom-left of each
//!   anti-diagonal
//! - **Horizontal**: row by row
//! - **Vertical**: column by column
//!
//! Tables for every block size 4..64 are built once per process and shared
//! through [`ScanTables::get`].

use std::sync::OnceLock;

/// Coefficient scanning pattern (scanIdx)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanPattern {
    /// Up-right diagonal (default)
    Diagonal = 0,
    /// Horizontal
    Horizontal = 1,
    /// Vertical
    Vertical = 2,
}

impl ScanPattern {
    fn index(self) -> usize {
        self as usize
    }

    /// Scan pattern for a transform block
    ///
    /// Mode-dependent scans apply to intra 4x4 blocks and to 8x8 luma
    /// blocks (8x8 chroma too in 4:4:4). `intra_mode` is the prediction
    /// mode of the component, or `None` for inter blocks.
    pub fn select(
        intra_mode: Option<u8>,
        log2_size: u8,
        is_luma: bool,
        chroma_444: bool,
        extended_modes: bool,
    ) -> ScanPattern {
        let mode = match intra_mode {
            Some(mode) => mode,
            None => return ScanPattern::Diagonal,
        };
        if !(log2_size == 2 || (log2_size == 3 && (is_luma || chroma_444))) {
            return ScanPattern::Diagonal;
        }
        let (horizontal, vertical, spread) = if extended_modes {
            (18u8, 50u8, 8u8)
        } else {
            (10, 26, 4)
        };
        if mode >= horizontal - spread && mode <= horizontal + spread {
            ScanPattern::Vertical
        } else if mode >= vertical - spread && mode <= vertical + spread {
            ScanPattern::Horizontal
        } else {
            ScanPattern::Diagonal
        }
    }
}

/// One scan order for one block size
#[derive(Debug, Clone)]
pub struct ScanOrder {
    log2_size: u8,
    /// Raster position of each coefficient in coding scan order
    positions: Vec<u16>,
    /// Raster index (in the CG grid) of each CG in scan order
    cg_positions: Vec<u16>,
    /// Scan index of each raster position
    inverse: Vec<u16>,
}

impl ScanOrder {
    fn build(log2_size: u8, pattern: ScanPattern) -> Self {
        let size = 1usize << log2_size;
        let log2_cgs = log2_size.saturating_sub(2);
        let cgs = 1usize << log2_cgs;

        let cg_scan = raster_scan(cgs, pattern);
        let inner = raster_scan(4.min(size), pattern);

        let mut positions = Vec::with_capacity(size * size);
        for &(cx, cy) in &cg_scan {
            for &(x, y) in &inner {
                positions.push(((cy * 4 + y) * size + cx * 4 + x) as u16);
            }
        }
        let mut inverse = vec![0u16; size * size];
        for (scan_pos, &pos) in positions.iter().enumerate() {
            inverse[pos as usize] = scan_pos as u16;
        }

        Self {
            log2_size,
            positions,
            cg_positions: cg_scan.iter().map(|&(x, y)| (y * cgs + x) as u16).collect(),
            inverse,
        }
    }

    /// log2 of the block size
    pub fn log2_size(&self) -> u8 {
        self.log2_size
    }

    /// Raster position of scan index `scan_pos`
    #[inline]
    pub fn position(&self, scan_pos: usize) -> usize {
        self.positions[scan_pos] as usize
    }

    /// Raster index of the CG at CG scan index `cg_idx`
    #[inline]
    pub fn cg_position(&self, cg_idx: usize) -> usize {
        self.cg_positions[cg_idx] as usize
    }

    /// Scan index of a raster position
    #[inline]
    pub fn scan_index(&self, raster_pos: usize) -> usize {
        self.inverse[raster_pos] as usize
    }

    /// Number of coefficients
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True for an empty order (never for a built table)
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of coefficient groups
    pub fn num_cgs(&self) -> usize {
        self.cg_positions.len()
    }

    /// Iterate over raster positions in scan order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.iter().map(|&p| p as usize)
    }
}

/// (x, y) positions of a `size`x`size` grid in scan order
fn raster_scan(size: usize, pattern: ScanPattern) -> Vec<(usize, usize)> {
    let mut order = Vec::with_capacity(size * size);
    match pattern {
        ScanPattern::Diagonal => {
            let (mut x, mut y) = (0isize, 0isize);
            while order.len() < size * size {
                while y >= 0 {
                    if (x as usize) < size && (y as usize) < size {
                        order.push((x as usize, y as usize));
                    }
                    y -= 1;
                    x += 1;
                }
                y = x;
                x = 0;
            }
        }
        ScanPattern::Horizontal => {
            for y in 0..size {
                for x in 0..size {
                    order.push((x, y));
                }
            }
        }
        ScanPattern::Vertical => {
            for x in 0..size {
                for y in 0..size {
                    order.push((x, y));
                }
            }
        }
    }
    order
}

/// Scan orders for log2 sizes 2..=6 and all three patterns
#[derive(Debug)]
pub struct ScanTables {
    orders: Vec<[ScanOrder; 3]>,
}

impl ScanTables {
    fn build() -> Self {
        let orders = (2u8..=6)
            .map(|log2| {
                [
                    ScanOrder::build(log2, ScanPattern::Diagonal),
                    ScanOrder::build(log2, ScanPattern::Horizontal),
                    ScanOrder::build(log2, ScanPattern::Vertical),
                ]
            })
            .collect();
        Self { orders }
    }

    /// Process-wide tables, built on first use
    pub fn get() -> &'static ScanTables {
        static TABLES: OnceLock<ScanTables> = OnceLock::new();
        TABLES.get_or_init(ScanTables::build)
    }

    /// Scan order for a block
    pub fn order(&self, log2_size: u8, pattern: ScanPattern) -> &ScanOrder {
        assert!((2..=6).contains(&log2_size), "invalid scan size log2 {}", log2_size);
        &self.orders[(log2_size - 2) as usize][pattern.index()]
    }
}
