//! Edit scripts over ordered sequences
//!
//! The alignment between two arrays is their longest common subsequence,
//! computed with the classic `|a| x |b|` dynamic programming table and walked
//! front to back. Everything outside the common subsequence becomes `remove`
//! and `add` runs. Time and memory are quadratic, which is fine for state
//! sized arrays; large sequences should be diffed with a coarser strategy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditOp<T> {
    /// Drops a run of the old array starting at `old_pos`. The run is given
    /// either by its `items` or only by its `length`.
    Remove {
        #[serde(rename = "oldPos")]
        old_pos: usize,
        #[serde(rename = "newPos")]
        new_pos: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Vec<T>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<usize>,
    },
    /// Inserts `items` so they start at `new_pos` in the new array, right
    /// before `old_pos` of the old one.
    Add {
        #[serde(rename = "oldPos")]
        old_pos: usize,
        #[serde(rename = "newPos")]
        new_pos: usize,
        items: Vec<T>,
    },
}

impl<T> EditOp<T> {
    pub fn remove(old_pos: usize, new_pos: usize, items: Vec<T>) -> Self {
        EditOp::Remove {
            old_pos,
            new_pos,
            items: Some(items),
            length: None,
        }
    }

    pub fn remove_count(old_pos: usize, new_pos: usize, length: usize) -> Self {
        EditOp::Remove {
            old_pos,
            new_pos,
            items: None,
            length: Some(length),
        }
    }

    pub fn add(old_pos: usize, new_pos: usize, items: Vec<T>) -> Self {
        EditOp::Add {
            old_pos,
            new_pos,
            items,
        }
    }

    pub fn old_pos(&self) -> usize {
        match self {
            EditOp::Remove { old_pos, .. } | EditOp::Add { old_pos, .. } => *old_pos,
        }
    }

    pub fn new_pos(&self) -> usize {
        match self {
            EditOp::Remove { new_pos, .. } | EditOp::Add { new_pos, .. } => *new_pos,
        }
    }

    /// Number of old elements this op drops.
    pub fn removed_len(&self) -> usize {
        match self {
            EditOp::Remove { items: Some(items), .. } => items.len(),
            EditOp::Remove { length, .. } => length.unwrap_or(0),
            EditOp::Add { .. } => 0,
        }
    }
}

/// Elements added and removed between two arrays, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Same { old: usize, new: usize },
    Remove { old: usize },
    Add { new: usize },
}

/// `table[i * (m + 1) + j]` is the LCS length of `a[i..]` and `b[j..]`.
fn lcs_table<T, F>(a: &[T], b: &[T], eq: &F) -> Vec<usize>
where
    F: Fn(&T, &T) -> bool,
{
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    let mut table = vec![0; (n + 1) * width];

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if eq(&a[i], &b[j]) {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    table
}

/// Walks the alignment front to back. Within a non-common region removals
/// are preferred over additions when both keep the LCS length.
fn walk<T, F>(a: &[T], b: &[T], eq: &F) -> Vec<Step>
where
    F: Fn(&T, &T) -> bool,
{
    let table = lcs_table(a, b, eq);
    let width = b.len() + 1;
    let (mut i, mut j) = (0, 0);
    let mut steps = Vec::with_capacity(a.len() + b.len());

    while i < a.len() && j < b.len() {
        if eq(&a[i], &b[j]) {
            steps.push(Step::Same { old: i, new: j });
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            steps.push(Step::Remove { old: i });
            i += 1;
        } else {
            steps.push(Step::Add { new: j });
            j += 1;
        }
    }
    steps.extend((i..a.len()).map(|old| Step::Remove { old }));
    steps.extend((j..b.len()).map(|new| Step::Add { new }));

    steps
}

/// Longest common subsequence of `a` and `b`.
pub fn same<T: Clone + PartialEq>(a: &[T], b: &[T]) -> Vec<T> {
    same_by(a, b, |x, y| x == y)
}

pub fn same_by<T, F>(a: &[T], b: &[T], eq: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    walk(a, b, &eq)
        .into_iter()
        .filter_map(|step| match step {
            Step::Same { old, .. } => Some(a[old].clone()),
            _ => None,
        })
        .collect()
}

pub fn diff<T: Clone + PartialEq>(a: &[T], b: &[T]) -> ArrayDiff<T> {
    diff_by(a, b, |x, y| x == y)
}

pub fn diff_by<T, F>(a: &[T], b: &[T], eq: F) -> ArrayDiff<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    let mut result = ArrayDiff {
        added: Vec::new(),
        removed: Vec::new(),
    };

    for step in walk(a, b, &eq) {
        match step {
            Step::Remove { old } => result.removed.push(a[old].clone()),
            Step::Add { new } => result.added.push(b[new].clone()),
            Step::Same { .. } => {}
        }
    }

    result
}

/// Edit script turning `a` into `b`.
///
/// Each maximal region outside the common subsequence, `a[i0..i1)` replaced
/// by `b[j0..j1)`, yields `remove(i0, j0, a[i0..i1))` followed by
/// `add(i1, j0, b[j0..j1))`; empty halves are left out.
pub fn get_patch<T: Clone + PartialEq>(a: &[T], b: &[T]) -> Vec<EditOp<T>> {
    get_patch_by(a, b, |x, y| x == y)
}

pub fn get_patch_by<T, F>(a: &[T], b: &[T], eq: F) -> Vec<EditOp<T>>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    let mut script = Vec::new();
    let (mut old_start, mut new_start) = (0, 0);
    let (mut old_end, mut new_end) = (0, 0);

    let flush = |script: &mut Vec<EditOp<T>>,
                 old_start: usize,
                 old_end: usize,
                 new_start: usize,
                 new_end: usize| {
        if old_end > old_start {
            script.push(EditOp::remove(old_start, new_start, a[old_start..old_end].to_vec()));
        }
        if new_end > new_start {
            script.push(EditOp::add(old_end, new_start, b[new_start..new_end].to_vec()));
        }
    };

    for step in walk(a, b, &eq) {
        match step {
            Step::Same { old, new } => {
                flush(&mut script, old_start, old_end, new_start, new_end);
                old_start = old + 1;
                old_end = old + 1;
                new_start = new + 1;
                new_end = new + 1;
            }
            Step::Remove { old } => old_end = old + 1,
            Step::Add { new } => new_end = new + 1,
        }
    }
    flush(&mut script, old_start, old_end, new_start, new_end);

    script
}

/// Replays `script` against `a`, in order, and returns the new array. The
/// untouched runs between consecutive `old_pos` anchors are copied from `a`,
/// so the ops must appear in the order [`get_patch`] emits them.
pub fn apply_patch<T: Clone>(a: &[T], script: &[EditOp<T>]) -> Vec<T> {
    let mut result = Vec::with_capacity(a.len());
    let mut same_start = 0;

    for op in script {
        let old_pos = op.old_pos().min(a.len());
        if same_start < old_pos {
            result.extend_from_slice(&a[same_start..old_pos]);
        }

        match op {
            EditOp::Add { items, .. } => {
                result.extend(items.iter().cloned());
                same_start = same_start.max(old_pos);
            }
            EditOp::Remove { .. } => {
                same_start = old_pos.saturating_add(op.removed_len()).min(a.len());
            }
        }
    }

    if same_start < a.len() {
        result.extend_from_slice(&a[same_start..]);
    }

    result
}
