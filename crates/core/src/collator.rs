//! Batch collation: padding encoded examples into rectangular tensors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoder::EncodedExample;
use crate::error::{Result, TemplateError};
use crate::media::SideChannel;
use crate::IGNORE_INDEX;

/// Side on which padding is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    #[default]
    Right,
    Left,
}

/// Sequence-parallel layout: each rank keeps one contiguous slice of every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceParallel {
    pub rank: usize,
    pub world_size: usize,
}

/// Fixed padding configuration of a bound template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollatorConfig {
    pub pad_token_id: i64,
    pub padding_side: PaddingSide,
    pub sequence_parallel: Option<SequenceParallel>,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            pad_token_id: 0,
            padding_side: PaddingSide::Right,
            sequence_parallel: None,
        }
    }
}

/// Padded batch tensors, row-major.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Batch {
    pub input_ids: Vec<Vec<i64>>,
    pub attention_mask: Vec<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<Vec<i64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_scale: Option<Vec<Vec<f32>>>,
    /// Media tensors concatenated in batch order.
    #[serde(skip)]
    pub side_channels: BTreeMap<String, SideChannel>,
    /// Per-example item counts for each side channel.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub media_counts: BTreeMap<String, Vec<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Padded sequence length (0 for an empty batch).
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }
}

fn pad_row<V: Clone>(mut row: Vec<V>, target: usize, value: V, side: PaddingSide) -> Vec<V> {
    let missing = target.saturating_sub(row.len());
    if missing == 0 {
        return row;
    }
    match side {
        PaddingSide::Right => {
            row.resize(target, value);
            row
        }
        PaddingSide::Left => {
            let mut padded = vec![value; missing];
            padded.append(&mut row);
            padded
        }
    }
}

fn slice_rows<V: Clone>(rows: &mut [Vec<V>], start: usize, end: usize) {
    for row in rows.iter_mut() {
        *row = row[start..end].to_vec();
    }
}

/// Pad `examples` to a common length.
///
/// The target length is `padding_to` when given (it must cover the longest
/// example), otherwise the longest example. Labels and loss scale are emitted
/// when any example carries them; rows missing a loss scale get 1.0 wherever
/// their label is kept.
pub fn collate(examples: &[EncodedExample], padding_to: Option<usize>, config: &CollatorConfig) -> Result<Batch> {
    let longest = examples.iter().map(EncodedExample::len).max().unwrap_or(0);
    let mut target = match padding_to {
        Some(padding_to) if padding_to < longest => {
            return Err(TemplateError::InvalidPadding(format!(
                "padding_to {padding_to} is shorter than the longest example ({longest})"
            )))
        }
        Some(padding_to) => padding_to,
        None => longest,
    };
    if let Some(sp) = config.sequence_parallel {
        if sp.world_size == 0 || sp.rank >= sp.world_size {
            return Err(TemplateError::InvalidPadding(format!(
                "rank {} is outside world size {}",
                sp.rank, sp.world_size
            )));
        }
        target = target.div_ceil(sp.world_size) * sp.world_size;
    }

    let side = config.padding_side;
    let has_labels = examples.iter().any(|e| e.labels.is_some());
    let has_loss_scale = examples.iter().any(|e| e.loss_scale.is_some());

    let mut batch = Batch::default();
    let mut labels = Vec::with_capacity(examples.len());
    let mut loss_scale = Vec::with_capacity(examples.len());
    for example in examples {
        let len = example.len();
        batch
            .input_ids
            .push(pad_row(example.input_ids.clone(), target, config.pad_token_id, side));
        batch.attention_mask.push(pad_row(vec![1; len], target, 0, side));

        let row_labels = example
            .labels
            .clone()
            .unwrap_or_else(|| vec![IGNORE_INDEX; len]);
        if has_loss_scale {
            let row_scale = example.loss_scale.clone().unwrap_or_else(|| {
                row_labels
                    .iter()
                    .map(|l| if *l == IGNORE_INDEX { 0.0 } else { 1.0 })
                    .collect()
            });
            loss_scale.push(pad_row(row_scale, target, 0.0, side));
        }
        if has_labels {
            labels.push(pad_row(row_labels, target, IGNORE_INDEX, side));
        }
    }

    if let Some(sp) = config.sequence_parallel {
        let chunk = target / sp.world_size;
        let (start, end) = (sp.rank * chunk, (sp.rank + 1) * chunk);
        slice_rows(&mut batch.input_ids, start, end);
        slice_rows(&mut batch.attention_mask, start, end);
        slice_rows(&mut labels, start, end);
        slice_rows(&mut loss_scale, start, end);
    }
    batch.labels = has_labels.then_some(labels);
    batch.loss_scale = has_loss_scale.then_some(loss_scale);

    let mut grouped: BTreeMap<&str, Vec<SideChannel>> = BTreeMap::new();
    for key in examples.iter().flat_map(|e| e.side_channels.keys()) {
        grouped.entry(key.as_str()).or_default();
    }
    for (key, parts) in grouped.iter_mut() {
        let counts: Vec<usize> = examples
            .iter()
            .map(|example| {
                let items = example.side_channels.get(*key).map_or(&[][..], Vec::as_slice);
                parts.extend_from_slice(items);
                items.len()
            })
            .collect();
        batch.media_counts.insert(key.to_string(), counts);
        batch.side_channels.insert(key.to_string(), SideChannel::concat(parts)?);
    }
    Ok(batch)
}
