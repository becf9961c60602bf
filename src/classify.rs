//! Assigns each alert record to exactly one priority bucket and sums
//! counts/areas per bucket. The rule table is ordered most- to
//! least-specific; a record belongs to the first rule that matches, so the
//! buckets always partition the input exactly.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::FieldBindings;
use crate::model::AlertRecord;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBucket {
    IntactForest,
    PrimaryForest,
    Peat,
    ProtectedAreas,
    Plantations,
    Other,
}

impl PriorityBucket {
    pub const ALL: [PriorityBucket; 6] = [
        PriorityBucket::IntactForest,
        PriorityBucket::PrimaryForest,
        PriorityBucket::Peat,
        PriorityBucket::ProtectedAreas,
        PriorityBucket::Plantations,
        PriorityBucket::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityBucket::IntactForest => "intact_forest",
            PriorityBucket::PrimaryForest => "primary_forest",
            PriorityBucket::Peat => "peat",
            PriorityBucket::ProtectedAreas => "protected_areas",
            PriorityBucket::Plantations => "plantations",
            PriorityBucket::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketTotals {
    pub count: u64,
    pub area_ha: f64,
}

/// Per-bucket sums plus the grand total. `total` always equals the sum of
/// the buckets because classification is a total partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityAggregate {
    buckets: BTreeMap<PriorityBucket, BucketTotals>,
    total: BucketTotals,
}

impl PriorityAggregate {
    pub fn bucket(&self, bucket: PriorityBucket) -> BucketTotals {
        self.buckets.get(&bucket).copied().unwrap_or_default()
    }

    pub fn total_count(&self) -> u64 {
        self.total.count
    }

    pub fn total_area_ha(&self) -> f64 {
        self.total.area_ha
    }

    fn add(&mut self, bucket: PriorityBucket, count: u64, area_ha: f64) {
        let entry = self.buckets.entry(bucket).or_default();
        entry.count += count;
        entry.area_ha += area_ha;
        self.total.count += count;
        self.total.area_ha += area_ha;
    }
}

type Predicate = fn(&AlertRecord, &FieldBindings) -> bool;

fn in_protected_area(record: &AlertRecord, fields: &FieldBindings) -> bool {
    record.label(&fields.protected_areas).is_some() || record.flag(&fields.protected_areas)
}

fn in_plantation(record: &AlertRecord, fields: &FieldBindings) -> bool {
    record.label(&fields.plantations).is_some() || record.flag(&fields.plantations)
}

fn on_peat(record: &AlertRecord, fields: &FieldBindings) -> bool {
    record.flag(&fields.peat)
}

fn in_primary_forest(record: &AlertRecord, fields: &FieldBindings) -> bool {
    record.flag(&fields.primary_forest)
}

fn in_intact_forest(record: &AlertRecord, fields: &FieldBindings) -> bool {
    record.flag(&fields.intact_forest)
}

/// Ordered rule table; field names come from per-family configuration.
const RULES: [(PriorityBucket, Predicate); 5] = [
    (PriorityBucket::ProtectedAreas, in_protected_area),
    (PriorityBucket::Plantations, in_plantation),
    (PriorityBucket::Peat, on_peat),
    (PriorityBucket::PrimaryForest, in_primary_forest),
    (PriorityBucket::IntactForest, in_intact_forest),
];

pub fn bucket_for(record: &AlertRecord, fields: &FieldBindings) -> PriorityBucket {
    for (bucket, matches) in RULES {
        if matches(record, fields) {
            return bucket;
        }
    }
    PriorityBucket::Other
}

pub fn classify(records: &[AlertRecord], fields: &FieldBindings) -> PriorityAggregate {
    let mut aggregate = PriorityAggregate::default();
    for record in records {
        let bucket = bucket_for(record, fields);
        aggregate.add(bucket, record.count(&fields.count), record.area_ha(&fields.area));
    }
    aggregate
}
