//! Aggregation of several datasets into one store, or into zarr groups when
//! the inputs do not share a grid.

use crate::{Dataset, VarSource, Variable};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How `/zarr/convert` combines its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Try a direct combine, fall back to grouping by grid signature.
    #[default]
    Auto,
    /// Union by variable name.
    Merge,
    /// Along `dim`, preferring `time` when present in all inputs.
    Concat,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationOptions {
    #[serde(default)]
    pub mode: AggregationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_vars: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl AggregationOptions {
    pub fn is_default(&self) -> bool {
        self == &AggregationOptions::default()
    }
}

/// A user-visible aggregation failure.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{reason} (group: {group_key:?}): {detail}")]
pub struct AggregationError {
    pub group_key: Option<String>,
    pub reason: String,
    pub detail: String,
}

impl AggregationError {
    fn new(reason: &str, detail: impl Into<String>) -> Self {
        Self {
            group_key: None,
            reason: reason.to_string(),
            detail: detail.into(),
        }
    }
}

/// Combine datasets into a mapping of zarr groups: `root` alone when one
/// store suffices, `group0`, `group1`, … when grouping was needed.
pub fn aggregate(
    datasets: &[Dataset],
    opts: &AggregationOptions,
) -> Result<IndexMap<String, Dataset>, AggregationError> {
    let mut out = IndexMap::new();
    if datasets.is_empty() {
        return Err(AggregationError::new("Nothing to aggregate.", "no inputs"));
    }
    match opts.mode {
        AggregationMode::Merge => {
            out.insert("root".to_string(), merge(datasets, opts)?);
            return Ok(out);
        }
        AggregationMode::Concat => {
            out.insert("root".to_string(), concat(datasets, opts)?);
            return Ok(out);
        }
        AggregationMode::Auto => {}
    }

    match auto_combine(datasets, opts) {
        Ok(combined) => {
            out.insert("root".to_string(), combined);
            Ok(out)
        }
        Err(error) => {
            let groups = group_by_signature(datasets, opts);
            if groups.len() == 1 {
                return Err(AggregationError {
                    group_key: groups.keys().next().cloned(),
                    reason: "Aggregation failed for a single group.".to_string(),
                    detail: error.detail,
                });
            }
            for (idx, (key, members)) in groups.into_iter().enumerate() {
                let combined = auto_combine(&members, opts).map_err(|e| AggregationError {
                    group_key: Some(key.clone()),
                    reason: "Aggregation failed for at least one group.".to_string(),
                    detail: e.detail,
                })?;
                out.insert(format!("group{idx}"), combined);
            }
            Ok(out)
        }
    }
}

fn auto_combine(
    datasets: &[Dataset],
    opts: &AggregationOptions,
) -> Result<Dataset, AggregationError> {
    if datasets.len() == 1 {
        return Ok(datasets[0].clone());
    }
    let var_sets: Vec<Vec<String>> = datasets.iter().map(|d| d.data_var_names()).collect();
    let identical = var_sets.iter().all(|s| *s == var_sets[0]);
    if identical {
        return concat(datasets, opts);
    }
    let disjoint = var_sets.iter().enumerate().all(|(i, a)| {
        var_sets
            .iter()
            .skip(i + 1)
            .all(|b| a.iter().all(|name| !b.contains(name)))
    });
    if disjoint {
        return merge(datasets, opts);
    }
    Err(AggregationError::new(
        "Cannot combine by coordinates.",
        "inputs neither share all variables nor none",
    ))
}

fn merge(datasets: &[Dataset], opts: &AggregationOptions) -> Result<Dataset, AggregationError> {
    let compat = opts.compat.as_deref().unwrap_or("no_conflicts");
    let mut base = datasets[0].clone();
    for other in &datasets[1..] {
        for (name, size) in &other.dims {
            match base.dims.get(name) {
                Some(existing) if existing != size => {
                    return Err(AggregationError::new(
                        "Merge failed.",
                        format!("dimension {name} has sizes {existing} and {size}"),
                    ));
                }
                Some(_) => {}
                None => {
                    base.dims.insert(name.clone(), *size);
                }
            }
        }
        for (name, var) in &other.variables {
            match base.variables.get(name) {
                None => {
                    base.variables.insert(name.clone(), var.clone());
                }
                Some(existing) if compat == "override" => {
                    let _ = existing;
                }
                Some(existing) => {
                    if existing.shape != var.shape || existing.dtype != var.dtype {
                        return Err(AggregationError::new(
                            "Merge failed.",
                            format!("conflicting definitions of variable {name}"),
                        ));
                    }
                }
            }
        }
    }
    base.path = joined_path(datasets);
    Ok(base)
}

fn concat(datasets: &[Dataset], opts: &AggregationOptions) -> Result<Dataset, AggregationError> {
    let dim = match &opts.dim {
        Some(dim) => dim.clone(),
        None => guess_concat_dim(datasets).ok_or_else(|| {
            AggregationError::new(
                "Cannot infer concat dimension.",
                "inputs share no dimension",
            )
        })?,
    };

    let mut combined = datasets[0].clone();
    let dim_total: usize = datasets.iter().map(|d| d.dims.get(&dim).copied().unwrap_or(0)).sum();
    combined.dims.insert(dim.clone(), dim_total);

    for (name, first) in &datasets[0].variables {
        let Some(axis) = first.dims.iter().position(|d| d == &dim) else {
            // Variables without the concat dimension come from the first input.
            continue;
        };
        let mut parts = Vec::with_capacity(datasets.len());
        let mut total = first.shape[axis];
        parts.push(first.clone());
        for other in &datasets[1..] {
            let Some(var) = other.variables.get(name) else {
                return Err(AggregationError::new(
                    "Concat failed.",
                    format!("variable {name} is missing from {}", other.path),
                ));
            };
            if var.dtype != first.dtype || var.dims != first.dims {
                return Err(AggregationError::new(
                    "Concat failed.",
                    format!("variable {name} differs between inputs"),
                ));
            }
            for (ax, (a, b)) in first.shape.iter().zip(&var.shape).enumerate() {
                if ax != axis && a != b {
                    return Err(AggregationError::new(
                        "Concat failed.",
                        format!("variable {name} has mismatched shape off the concat axis"),
                    ));
                }
            }
            total += var.shape[axis];
            parts.push(var.clone());
        }
        let mut shape = first.shape.clone();
        shape[axis] = total;
        let merged = Variable {
            name: name.clone(),
            dims: first.dims.clone(),
            shape,
            dtype: first.dtype,
            attrs: first.attrs.clone(),
            fill_value: first.fill_value.clone(),
            source: VarSource::Concat { axis, parts },
        };
        combined.variables.insert(name.clone(), merged);
    }
    combined.path = joined_path(datasets);
    Ok(combined)
}

/// Prefer `time`; otherwise the first common dimension in name order.
fn guess_concat_dim(datasets: &[Dataset]) -> Option<String> {
    let mut common: Vec<String> = datasets[0].dims.keys().cloned().collect();
    for other in &datasets[1..] {
        common.retain(|dim| other.dims.contains_key(dim));
    }
    if common.iter().any(|d| d == "time") {
        return Some("time".to_string());
    }
    common.sort();
    common.into_iter().next()
}

const GRID_COORDS: &[&str] = &["lat", "lon", "rlat", "rlon", "x", "y"];

/// Cheap grouping signature over dimensions and key coordinates.
fn grid_signature(dataset: &Dataset) -> String {
    let mut dims: Vec<String> = dataset
        .dims
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    dims.sort();
    let coords: Vec<String> = GRID_COORDS
        .iter()
        .filter_map(|k| dataset.variables.get(*k))
        .map(|c| format!("{}:{:?}:{:?}", c.name, c.dims, c.shape))
        .collect();
    format!("dims[{}]|coords[{}]", dims.join(","), coords.join(","))
}

fn vars_signature(dataset: &Dataset) -> String {
    let mut names = dataset.data_var_names();
    names.sort();
    names.join(",")
}

fn group_by_signature(
    datasets: &[Dataset],
    opts: &AggregationOptions,
) -> IndexMap<String, Vec<Dataset>> {
    let group_by = opts.group_by.as_deref().unwrap_or("grid");
    let mut groups: IndexMap<String, Vec<Dataset>> = IndexMap::new();
    for dataset in datasets {
        let key = match group_by {
            "vars" => vars_signature(dataset),
            _ => grid_signature(dataset),
        };
        groups.entry(key).or_default().push(dataset.clone());
    }
    groups
}

fn joined_path(datasets: &[Dataset]) -> String {
    datasets
        .iter()
        .map(|d| d.path.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Attrs;
    use ndarray::Array;
    use zarr_view::ArrayBuffer;

    fn dataset(path: &str, var: &str, time: usize, lat: usize, offset: i32) -> Dataset {
        let data = ArrayBuffer::I32(
            Array::from_iter(offset..offset + (time * lat) as i32)
                .into_shape_with_order((time, lat))
                .unwrap()
                .into_dyn(),
        );
        let mut variables = IndexMap::new();
        variables.insert(
            var.to_string(),
            Variable::in_memory(var, &["time", "lat"], Attrs::new(), data),
        );
        Dataset {
            path: path.to_string(),
            attrs: Attrs::new(),
            dims: [("time".to_string(), time), ("lat".to_string(), lat)]
                .into_iter()
                .collect(),
            variables,
        }
    }

    #[test]
    fn identical_variables_concat_along_time() {
        let a = dataset("/a.nc", "tas", 2, 3, 0);
        let b = dataset("/b.nc", "tas", 1, 3, 100);
        let out = aggregate(&[a, b], &AggregationOptions::default()).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["root"]);

        let root = &out["root"];
        assert_eq!(root.dims["time"], 3);
        let tas = root.variable("tas").unwrap();
        assert_eq!(tas.shape, vec![3, 3]);
        let ArrayBuffer::I32(data) = tas.read().unwrap() else {
            panic!("expected i32")
        };
        assert_eq!(data[[0, 0]], 0);
        assert_eq!(data[[2, 0]], 100);
    }

    #[test]
    fn disjoint_variables_merge() {
        let a = dataset("/a.nc", "tas", 2, 3, 0);
        let b = dataset("/b.nc", "pr", 2, 3, 0);
        let out = aggregate(&[a, b], &AggregationOptions::default()).unwrap();
        let root = &out["root"];
        assert!(root.variables.contains_key("tas"));
        assert!(root.variables.contains_key("pr"));
        assert_eq!(root.path, "/a.nc;/b.nc");
    }

    #[test]
    fn mismatched_grids_fall_back_to_groups() {
        // Same variable, different lat size: concat fails off-axis, and the
        // two inputs land in separate grid groups.
        let a = dataset("/a.nc", "tas", 2, 3, 0);
        let b = dataset("/b.nc", "tas", 2, 4, 0);
        let out = aggregate(&[a, b], &AggregationOptions::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("group0"));
        assert!(out.contains_key("group1"));
    }

    #[test]
    fn explicit_concat_dim_is_honored() {
        let a = dataset("/a.nc", "tas", 2, 3, 0);
        let b = dataset("/b.nc", "tas", 2, 3, 50);
        let opts = AggregationOptions {
            mode: AggregationMode::Concat,
            dim: Some("time".to_string()),
            ..Default::default()
        };
        let out = aggregate(&[a, b], &opts).unwrap();
        assert_eq!(out["root"].dims["time"], 4);
    }

    #[test]
    fn merge_conflicts_surface_as_errors() {
        let a = dataset("/a.nc", "tas", 2, 3, 0);
        let b = dataset("/b.nc", "tas", 2, 4, 0);
        let opts = AggregationOptions {
            mode: AggregationMode::Merge,
            ..Default::default()
        };
        let err = aggregate(&[a, b], &opts).unwrap_err();
        assert_eq!(err.reason, "Merge failed.");
    }
}
