//! Adaptive loop filter parameter syntax
//!
//! Only the bitstream representation of ALF parameters lives here; filter
//! derivation and filtering are done elsewhere. Luma filters use one of
//! three symmetric diamond shapes and are shared among up to 25 classes
//! through a monotone class-to-filter pattern.
//!
//! Coefficients are Golomb-Rice coded. The Golomb parameter depends on the
//! coefficient's scan group (its ring in the diamond) and is chosen by the
//! encoder with a bit-count search: a start value `k_min` and, per group, a
//! flag telling whether k grows by one.

use std::collections::VecDeque;

use super::config::ChromaFormat;
use super::sbac::{SymbolDecoder, SymbolEncoder};
use crate::error::{Error, Result};

/// Luma classes
pub const NUM_ALF_CLASSES: usize = 25;
/// Parameter sets kept for temporal prediction
pub const ALF_STORE_SIZE: usize = 6;
/// Largest Golomb start parameter tried by the encoder
const MAX_K_START: u32 = 8;
/// Largest Golomb start parameter accepted by the parser
const MAX_PARSED_K_START: u32 = 16;
/// Coefficient magnitude limit for luma and chroma filters
pub const ALF_MAX_COEFF: i32 = 1 << 10;

fn coeffs_in_range(filter: &[i32]) -> bool {
    filter.iter().all(|c| c.unsigned_abs() <= ALF_MAX_COEFF as u32)
}

/// Symmetric diamond filter shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlfShape {
    Diamond5x5,
    Diamond7x7,
    Diamond9x9,
}

impl AlfShape {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(AlfShape::Diamond5x5),
            1 => Some(AlfShape::Diamond7x7),
            2 => Some(AlfShape::Diamond9x9),
            _ => None,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            AlfShape::Diamond5x5 => 0,
            AlfShape::Diamond7x7 => 1,
            AlfShape::Diamond9x9 => 2,
        }
    }

    /// Half-width of the diamond
    pub fn radius(&self) -> i32 {
        self.index() as i32 + 2
    }

    /// Coefficients sent per filter (one per symmetric pair plus the center)
    pub fn num_coeffs(&self) -> usize {
        let r = self.radius() as usize;
        r * r + r + 1
    }

    /// Number of Golomb scan groups
    pub fn num_groups(&self) -> usize {
        self.radius() as usize + 1
    }

    /// (dx, dy) of each coefficient, top row first, center last
    pub fn positions(&self) -> Vec<(i32, i32)> {
        let r = self.radius();
        let mut out = Vec::with_capacity(self.num_coeffs());
        for dy in -r..=0 {
            let span = r - dy.abs();
            let last = if dy == 0 { 0 } else { span };
            for dx in -span..=last {
                out.push((dx, dy));
            }
        }
        out
    }

    /// Scan group of each coefficient: 0 for the outer ring, radius for the center
    pub fn scan_groups(&self) -> Vec<usize> {
        let r = self.radius();
        self.positions()
            .iter()
            .map(|&(dx, dy)| (r - dx.abs() - dy.abs()) as usize)
            .collect()
    }
}

/// Luma filters of one parameter set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlfFilterSet {
    pub shape: AlfShape,
    /// Coefficients, `shape.num_coeffs()` per filter
    pub filters: Vec<Vec<i32>>,
    /// Filter index of each class; starts at 0 and grows by at most one
    pub class_to_filter: [u8; NUM_ALF_CLASSES],
}

impl AlfFilterSet {
    /// One filter shared by every class
    pub fn single(shape: AlfShape, coeffs: Vec<i32>) -> Self {
        Self {
            shape,
            filters: vec![coeffs],
            class_to_filter: [0; NUM_ALF_CLASSES],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.filters.is_empty() || self.filters.len() > NUM_ALF_CLASSES {
            return Err(Error::invalid_input(format!(
                "ALF needs 1..={} filters, got {}",
                NUM_ALF_CLASSES,
                self.filters.len()
            )));
        }
        if self.filters.iter().any(|f| f.len() != self.shape.num_coeffs()) {
            return Err(Error::invalid_input("ALF filter length does not match its shape"));
        }
        if !self.filters.iter().all(|f| coeffs_in_range(f)) {
            return Err(Error::invalid_input(format!(
                "ALF coefficient exceeds ±{}",
                ALF_MAX_COEFF
            )));
        }
        if self.class_to_filter[0] != 0 {
            return Err(Error::invalid_input("ALF class 0 must use filter 0"));
        }
        for pair in self.class_to_filter.windows(2) {
            if pair[1] != pair[0] && pair[1] != pair[0] + 1 {
                return Err(Error::invalid_input("ALF class pattern must be monotone"));
            }
        }
        let used = self.class_to_filter[NUM_ALF_CLASSES - 1] as usize + 1;
        if used != self.filters.len() {
            return Err(Error::invalid_input(format!(
                "ALF class pattern uses {} filters, {} given",
                used,
                self.filters.len()
            )));
        }
        Ok(())
    }
}

/// Chroma components carrying a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlfChromaIdc {
    pub cb: bool,
    pub cr: bool,
}

impl AlfChromaIdc {
    fn bits(&self) -> u32 {
        (self.cb as u32) << 1 | self.cr as u32
    }

    fn from_bits(bits: u32) -> Self {
        Self {
            cb: bits & 2 != 0,
            cr: bits & 1 != 0,
        }
    }

    pub fn any(&self) -> bool {
        self.cb || self.cr
    }
}

/// Shape of the chroma filter
pub const ALF_CHROMA_SHAPE: AlfShape = AlfShape::Diamond5x5;

/// Slice-level ALF parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlfParams {
    pub enabled: bool,
    /// Index into the temporal store; luma filters are then not sent
    pub temporal_idx: Option<usize>,
    /// Luma filters (sent, or restored from the store when temporally predicted)
    pub luma: Option<AlfFilterSet>,
    /// Filters after the first are coded as differences to the previous one
    pub predict_filters: bool,
    pub chroma_idc: AlfChromaIdc,
    /// Chroma coefficients for `ALF_CHROMA_SHAPE`
    pub chroma: Vec<i32>,
    /// CU control depth, `None` for slice-wide filtering
    pub cu_control_depth: Option<u8>,
}

impl AlfParams {
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// Recently sent luma filter sets, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlfStore {
    sets: VecDeque<AlfFilterSet>,
}

impl AlfStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&AlfFilterSet> {
        self.sets.get(idx)
    }

    /// Remember a set; the oldest is dropped once the store is full
    pub fn push(&mut self, set: AlfFilterSet) {
        if self.sets.len() == ALF_STORE_SIZE {
            self.sets.pop_back();
        }
        self.sets.push_front(set);
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Golomb parameter search
// ─────────────────────────────────────────────────────────────────────────────

/// Bits of a signed Golomb-Rice code
pub fn golomb_length(value: i32, k: u32) -> u32 {
    let abs = value.unsigned_abs();
    (abs >> k) + 1 + k + (abs != 0) as u32
}

/// Golomb parameter per scan group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GolombTable {
    pub k_start: u32,
    pub k: Vec<u32>,
}

/// Pick `k_start` and per-group increments minimizing the coded size of `filters`
pub fn search_golomb_table(filters: &[Vec<i32>], groups: &[usize], num_groups: usize) -> GolombTable {
    let max_k = MAX_K_START as usize + num_groups + 1;
    let mut bits = vec![vec![0u64; max_k + 1]; num_groups];
    for filter in filters {
        for (&coeff, &group) in filter.iter().zip(groups) {
            for (k, slot) in bits[group].iter_mut().enumerate() {
                *slot += golomb_length(coeff, k as u32) as u64;
            }
        }
    }

    let walk = |k_start: u32| -> (u64, Vec<u32>) {
        let mut k = k_start;
        let mut total = 0u64;
        let mut table = Vec::with_capacity(num_groups);
        for group_bits in &bits {
            if group_bits[k as usize + 1] < group_bits[k as usize] {
                k += 1;
            }
            total += group_bits[k as usize];
            table.push(k);
        }
        (total, table)
    };

    let mut best: Option<(u64, u32, Vec<u32>)> = None;
    for k_start in 1..MAX_K_START {
        let (total, table) = walk(k_start);
        if best.as_ref().map_or(true, |(b, _, _)| total < *b) {
            best = Some((total, k_start, table));
        }
    }
    let (_, k_start, k) = best.unwrap_or((0, 1, vec![1; num_groups]));
    GolombTable { k_start, k }
}

fn encode_golomb_table<S: SymbolEncoder>(codec: &mut S, table: &GolombTable) {
    codec.encode_exp_golomb_ep(table.k_start - 1, 0);
    let mut k = table.k_start;
    for &group_k in &table.k {
        codec.encode_flag_ep(group_k != k);
        k = group_k;
    }
}

fn decode_golomb_table<S: SymbolDecoder>(codec: &mut S, num_groups: usize) -> Result<GolombTable> {
    let k_start = codec.decode_exp_golomb_ep(0)? + 1;
    if k_start > MAX_PARSED_K_START {
        tracing::warn!("ALF Golomb start {} exceeds {}", k_start, MAX_PARSED_K_START);
        return Err(Error::conformance(format!("ALF k_min {} out of range", k_start)));
    }
    let mut k = k_start;
    let mut table = Vec::with_capacity(num_groups);
    for _ in 0..num_groups {
        if codec.decode_flag_ep()? {
            k += 1;
        }
        table.push(k);
    }
    Ok(GolombTable { k_start, k: table })
}

fn encode_filters<S: SymbolEncoder>(codec: &mut S, shape: AlfShape, filters: &[Vec<i32>]) {
    let groups = shape.scan_groups();
    let table = search_golomb_table(filters, &groups, shape.num_groups());
    tracing::debug!(
        shape = ?shape,
        filters = filters.len(),
        k_start = table.k_start,
        k = ?table.k,
        "ALF Golomb table"
    );
    encode_golomb_table(codec, &table);
    for filter in filters {
        for (&coeff, &group) in filter.iter().zip(&groups) {
            codec.encode_golomb_ep(coeff, table.k[group]);
        }
    }
}

fn decode_filters<S: SymbolDecoder>(
    codec: &mut S,
    shape: AlfShape,
    num_filters: usize,
) -> Result<Vec<Vec<i32>>> {
    let groups = shape.scan_groups();
    let table = decode_golomb_table(codec, shape.num_groups())?;
    let mut filters = Vec::with_capacity(num_filters);
    for _ in 0..num_filters {
        let mut filter = Vec::with_capacity(groups.len());
        for &group in &groups {
            filter.push(codec.decode_golomb_ep(table.k[group])?);
        }
        filters.push(filter);
    }
    Ok(filters)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter syntax
// ─────────────────────────────────────────────────────────────────────────────

/// Write ALF parameters; a newly sent luma set is pushed to `store`
pub fn encode_alf_params<S: SymbolEncoder>(
    codec: &mut S,
    params: &AlfParams,
    store: &mut AlfStore,
    format: ChromaFormat,
) -> Result<()> {
    codec.encode_flag_ep(params.enabled);
    if !params.enabled {
        return Ok(());
    }

    if !store.is_empty() {
        codec.encode_flag_ep(params.temporal_idx.is_some());
    }
    match params.temporal_idx {
        Some(idx) => {
            if idx >= store.len() {
                return Err(Error::invalid_input(format!(
                    "ALF temporal index {} with {} stored sets",
                    idx,
                    store.len()
                )));
            }
            codec.encode_exp_golomb_ep(idx as u32, 0);
        }
        None => {
            let set = params
                .luma
                .as_ref()
                .ok_or_else(|| Error::invalid_input("enabled ALF without luma filters"))?;
            set.validate()?;
            encode_luma_filters(codec, set, params.predict_filters);
            store.push(set.clone());
        }
    }

    if format.has_chroma() {
        codec.encode_bits_ep(params.chroma_idc.bits(), 2);
        if params.chroma_idc.any() {
            if params.chroma.len() != ALF_CHROMA_SHAPE.num_coeffs() {
                return Err(Error::invalid_input("ALF chroma filter length does not match its shape"));
            }
            if !coeffs_in_range(&params.chroma) {
                return Err(Error::invalid_input(format!(
                    "ALF chroma coefficient exceeds ±{}",
                    ALF_MAX_COEFF
                )));
            }
            encode_filters(codec, ALF_CHROMA_SHAPE, std::slice::from_ref(&params.chroma));
        }
    }

    codec.encode_flag_ep(params.cu_control_depth.is_some());
    if let Some(depth) = params.cu_control_depth {
        codec.encode_exp_golomb_ep(depth as u32, 0);
    }
    Ok(())
}

fn encode_luma_filters<S: SymbolEncoder>(codec: &mut S, set: &AlfFilterSet, predict: bool) {
    let num_filters = set.filters.len();
    codec.encode_exp_golomb_ep(set.shape.index(), 0);
    codec.encode_exp_golomb_ep(num_filters as u32 - 1, 0);
    if num_filters > 1 {
        for pair in set.class_to_filter.windows(2) {
            codec.encode_flag_ep(pair[1] != pair[0]);
        }
        codec.encode_flag_ep(predict);
    }

    let predict = predict && num_filters > 1;
    let coded: Vec<Vec<i32>> = set
        .filters
        .iter()
        .enumerate()
        .map(|(i, filter)| {
            if predict && i > 0 {
                filter
                    .iter()
                    .zip(&set.filters[i - 1])
                    .map(|(c, p)| c - p)
                    .collect()
            } else {
                filter.clone()
            }
        })
        .collect();
    encode_filters(codec, set.shape, &coded);
}

/// Parse ALF parameters; a newly received luma set is pushed to `store`
pub fn decode_alf_params<S: SymbolDecoder>(
    codec: &mut S,
    store: &mut AlfStore,
    format: ChromaFormat,
) -> Result<AlfParams> {
    let mut params = AlfParams {
        enabled: codec.decode_flag_ep()?,
        ..Default::default()
    };
    if !params.enabled {
        return Ok(params);
    }

    let temporal = !store.is_empty() && codec.decode_flag_ep()?;
    if temporal {
        let idx = codec.decode_exp_golomb_ep(0)? as usize;
        let set = store.get(idx).cloned().ok_or_else(|| {
            tracing::warn!("ALF temporal index {} with {} stored sets", idx, store.len());
            Error::conformance(format!("ALF temporal index {} out of range", idx))
        })?;
        params.temporal_idx = Some(idx);
        params.luma = Some(set);
    } else {
        let (set, predict) = decode_luma_filters(codec)?;
        params.predict_filters = predict;
        store.push(set.clone());
        params.luma = Some(set);
    }

    if format.has_chroma() {
        params.chroma_idc = AlfChromaIdc::from_bits(codec.decode_bits_ep(2)?);
        if params.chroma_idc.any() {
            params.chroma = decode_filters(codec, ALF_CHROMA_SHAPE, 1)?
                .pop()
                .unwrap_or_default();
            if !coeffs_in_range(&params.chroma) {
                tracing::warn!("ALF chroma coefficient exceeds ±{}", ALF_MAX_COEFF);
                return Err(Error::conformance("ALF chroma coefficient out of range"));
            }
        }
    }

    if codec.decode_flag_ep()? {
        let depth = codec.decode_exp_golomb_ep(0)?;
        if depth > 4 {
            tracing::warn!("ALF CU control depth {} exceeds 4", depth);
            return Err(Error::conformance(format!("ALF CU control depth {} out of range", depth)));
        }
        params.cu_control_depth = Some(depth as u8);
    }
    Ok(params)
}

fn decode_luma_filters<S: SymbolDecoder>(codec: &mut S) -> Result<(AlfFilterSet, bool)> {
    let shape_idx = codec.decode_exp_golomb_ep(0)?;
    let shape = AlfShape::from_index(shape_idx).ok_or_else(|| {
        tracing::warn!("invalid ALF shape index {}", shape_idx);
        Error::conformance(format!("ALF shape index {} out of range", shape_idx))
    })?;
    let num_filters = codec.decode_exp_golomb_ep(0)? as usize + 1;
    if num_filters > NUM_ALF_CLASSES {
        tracing::warn!("{} ALF filters exceed {} classes", num_filters, NUM_ALF_CLASSES);
        return Err(Error::conformance(format!("{} ALF filters out of range", num_filters)));
    }

    let mut class_to_filter = [0u8; NUM_ALF_CLASSES];
    let mut predict = false;
    if num_filters > 1 {
        for class in 1..NUM_ALF_CLASSES {
            let step = codec.decode_flag_ep()? as u8;
            class_to_filter[class] = class_to_filter[class - 1] + step;
        }
        let used = class_to_filter[NUM_ALF_CLASSES - 1] as usize + 1;
        if used != num_filters {
            tracing::warn!("ALF class pattern uses {} of {} filters", used, num_filters);
            return Err(Error::conformance(format!(
                "ALF class pattern uses {} filters, {} signaled",
                used, num_filters
            )));
        }
        predict = codec.decode_flag_ep()?;
    }

    let mut filters = decode_filters(codec, shape, num_filters)?;
    if predict {
        for i in 1..filters.len() {
            let (done, rest) = filters.split_at_mut(i);
            for (c, p) in rest[0].iter_mut().zip(&done[i - 1]) {
                *c = c.saturating_add(*p);
            }
        }
    }
    if !filters.iter().all(|f| coeffs_in_range(f)) {
        tracing::warn!("ALF luma coefficient exceeds ±{}", ALF_MAX_COEFF);
        return Err(Error::conformance("ALF luma coefficient out of range"));
    }
    Ok((
        AlfFilterSet {
            shape,
            filters,
            class_to_filter,
        },
        predict,
    ))
}
