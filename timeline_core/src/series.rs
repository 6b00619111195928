//! Per-field scalar history derived step by step from model snapshots.
//!
//! Series are persistent (`im`) collections: accumulating step `n + 1` from
//! step `n` shares structure with the previous series instead of copying it,
//! and never mutates it.

use im::{OrdMap, OrdSet, Vector};

use crate::step::{ModelSnapshot, Scalar};

/// One series entry. `None` is the placeholder for a step where the field
/// was not reported (or reported `null`).
pub type SeriesValue = Option<Scalar>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarSeries {
    fields: OrdMap<String, Vector<SeriesValue>>,
    /// Fields known to the series that the latest snapshot did not report.
    absent: OrdSet<String>,
    len: usize,
}

impl ScalarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// A series that already covers `len` steps but has no fields yet, so a
    /// field first reported afterwards is back-filled to the right length.
    pub fn with_placeholders(len: usize) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }

    /// Number of steps covered; every field has exactly this many entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn field(&self, name: &str) -> Option<&Vector<SeriesValue>> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Vector<SeriesValue>)> {
        self.fields.iter()
    }

    /// Plot-ready values for `name`; placeholders and text become `None`.
    pub fn numeric(&self, name: &str) -> Option<Vec<Option<f64>>> {
        self.fields.get(name).map(|values| {
            values
                .iter()
                .map(|value| value.as_ref().and_then(Scalar::as_f64))
                .collect()
        })
    }

    /// True when both series are the same in-memory value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.len == other.len && self.fields.ptr_eq(&other.fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDrift {
    /// Field first reported at step index `at`, back-filled before it.
    Appeared { field: String, at: usize },
    /// Field stopped being reported at step index `at`; placeholders are
    /// appended until it returns.
    Disappeared { field: String, at: usize },
}

#[derive(Debug, Clone)]
pub struct Accumulated {
    pub series: ScalarSeries,
    pub drift: Vec<SchemaDrift>,
}

/// Extend `previous` by one step with the scalar fields of `snapshot`.
pub fn accumulate(previous: &ScalarSeries, snapshot: &ModelSnapshot) -> Accumulated {
    let at = previous.len;
    let mut fields = previous.fields.clone();
    let mut absent = previous.absent.clone();
    let mut drift = Vec::new();

    for (name, value) in &snapshot.scalars {
        if let Some(values) = fields.get_mut(name) {
            values.push_back(value.clone());
            absent.remove(name);
            continue;
        }
        let mut values: Vector<SeriesValue> = std::iter::repeat(None).take(at).collect();
        values.push_back(value.clone());
        fields.insert(name.clone(), values);
        if at > 0 {
            drift.push(SchemaDrift::Appeared {
                field: name.clone(),
                at,
            });
        }
    }

    let missing: Vec<String> = previous
        .fields
        .keys()
        .filter(|name| !snapshot.scalars.contains_key(*name))
        .cloned()
        .collect();
    for name in missing {
        if let Some(values) = fields.get_mut(&name) {
            values.push_back(None);
        }
        if absent.insert(name.clone()).is_none() {
            drift.push(SchemaDrift::Disappeared { field: name, at });
        }
    }

    Accumulated {
        series: ScalarSeries {
            fields,
            absent,
            len: at + 1,
        },
        drift,
    }
}
