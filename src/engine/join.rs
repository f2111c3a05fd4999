//! Join stage: group fetched datasets by entity key.
//!
//! The primary dataset decides which entities exist. Required datasets act
//! as an inner join (an entity without rows there is dropped with a reason);
//! optional datasets are attached when present.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{Record, RecordExt};

use super::pipeline::DatasetRequest;

/// Records loaded for one named dataset.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub entity_field: String,
    pub records: Vec<Record>,
}

/// Output of the fetch stage: every dataset loaded so far, by name.
#[derive(Debug, Clone, Default)]
pub struct FetchedData {
    datasets: BTreeMap<String, Dataset>,
}

impl FetchedData {
    /// Append the records loaded for `request` to its dataset. Records from
    /// a per-entity request are tagged with that entity when the source
    /// omits it.
    pub fn insert(&mut self, request: &DatasetRequest, mut records: Vec<Record>) {
        if let Some(entity) = &request.entity {
            for record in &mut records {
                record
                    .entry(request.entity_field.clone())
                    .or_insert_with(|| Value::String(entity.clone()));
            }
        }
        let dataset = self
            .datasets
            .entry(request.dataset.clone())
            .or_insert_with(|| Dataset {
                entity_field: request.entity_field.clone(),
                records: Vec::new(),
            });
        dataset.records.extend(records);
    }

    pub fn get(&self, dataset: &str) -> Option<&Dataset> {
        self.datasets.get(dataset)
    }

    /// Records of `dataset`, empty when never loaded.
    pub fn records(&self, dataset: &str) -> &[Record] {
        self.datasets
            .get(dataset)
            .map_or(&[][..], |d| d.records.as_slice())
    }

    /// Distinct entity keys present in `dataset`, sorted.
    pub fn entities(&self, dataset: &str) -> Vec<String> {
        let Some(data) = self.datasets.get(dataset) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = data
            .records
            .iter()
            .filter_map(|r| r.str_field(&data.entity_field).map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn total_records(&self) -> usize {
        self.datasets.values().map(|d| d.records.len()).sum()
    }
}

/// Which datasets drive and constrain the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    pub primary: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl JoinPlan {
    pub fn new(primary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    pub fn require(mut self, dataset: &str) -> Self {
        self.required.push(dataset.to_string());
        self
    }

    pub fn optional(mut self, dataset: &str) -> Self {
        self.optional.push(dataset.to_string());
        self
    }
}

/// All joined rows for one entity, by dataset name.
#[derive(Debug, Clone, Default)]
pub struct EntityRecords {
    pub entity: String,
    datasets: BTreeMap<String, Vec<Record>>,
}

impl EntityRecords {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            datasets: BTreeMap::new(),
        }
    }

    pub fn with(mut self, dataset: &str, records: Vec<Record>) -> Self {
        self.datasets.insert(dataset.to_string(), records);
        self
    }

    /// Rows for `dataset`, empty when the entity has none.
    pub fn get(&self, dataset: &str) -> &[Record] {
        self.datasets
            .get(dataset)
            .map_or(&[][..], Vec::as_slice)
    }
}

/// An entity removed from the run, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub entity: String,
    pub reason: String,
}

/// Output of the join stage.
#[derive(Debug, Clone, Default)]
pub struct Joined {
    pub entities: Vec<EntityRecords>,
    pub dropped: Vec<Dropped>,
}

fn group_by_entity(data: Option<&Dataset>) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    if let Some(data) = data {
        for record in &data.records {
            if let Some(key) = record.str_field(&data.entity_field) {
                groups.entry(key.to_string()).or_default().push(record.clone());
            }
        }
    }
    groups
}

/// Join `fetched` according to `plan`. Entities come out sorted by key.
pub fn join(fetched: &FetchedData, plan: &JoinPlan) -> Joined {
    let primary = group_by_entity(fetched.get(&plan.primary));
    let required: Vec<(&String, BTreeMap<String, Vec<Record>>)> = plan
        .required
        .iter()
        .map(|name| (name, group_by_entity(fetched.get(name))))
        .collect();
    let mut optional: Vec<(&String, BTreeMap<String, Vec<Record>>)> = plan
        .optional
        .iter()
        .map(|name| (name, group_by_entity(fetched.get(name))))
        .collect();

    let mut joined = Joined::default();
    'entities: for (entity, rows) in primary {
        let mut out = EntityRecords::new(&entity).with(&plan.primary, rows);
        for (name, groups) in &required {
            match groups.get(&entity) {
                Some(rows) => out.datasets.insert((*name).clone(), rows.clone()),
                None => {
                    joined.dropped.push(Dropped {
                        entity,
                        reason: format!("no {name} data"),
                    });
                    continue 'entities;
                }
            };
        }
        for (name, groups) in &mut optional {
            if let Some(rows) = groups.remove(&entity) {
                out.datasets.insert((*name).clone(), rows);
            }
        }
        joined.entities.push(out);
    }
    joined
}
