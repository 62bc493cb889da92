//! Static STAC catalogue assembly: a zip archive holding the catalog, one
//! collection, and one item per result document. Spatial and temporal
//! extents accumulate while documents stream and the collection is written
//! last.

use crate::{render_scalar, Document, SearchError};
use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use futures::StreamExt;
use models::UniqKey;
use serde_json::{json, Value};
use std::io::Write;

const STAC_VERSION: &str = "1.0.0";

pub struct StacCatalogue {
    pub collection_id: String,
    uniq_key: UniqKey,
    bbox: Option<[f64; 4]>,
    interval: Option<(NaiveDateTime, NaiveDateTime)>,
    items: u64,
}

/// `[start TO end]` interval strings as the index stores them.
fn parse_time_interval(value: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let trimmed = value.trim().trim_start_matches('[').trim_end_matches(']');
    let (start, end) = trimmed.split_once(" TO ")?;
    let parse = |v: &str| {
        let v = v.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M"))
            .ok()
    };
    Some((parse(start)?, parse(end)?))
}

/// `ENVELOPE(minLon, maxLon, maxLat, minLat)` → `[minLon, minLat, maxLon, maxLat]`.
fn parse_envelope(value: &str) -> Option<[f64; 4]> {
    let inner = value
        .trim()
        .strip_prefix("ENVELOPE(")?
        .strip_suffix(')')?;
    let parts: Vec<f64> = inner
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    let [min_lon, max_lon, max_lat, min_lat] = parts.as_slice() else {
        return None;
    };
    Some([*min_lon, *min_lat, *max_lon, *max_lat])
}

fn normalize_id(value: &str) -> String {
    let slug: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

impl StacCatalogue {
    pub fn new(collection_id: &str, uniq_key: UniqKey) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            uniq_key,
            bbox: None,
            interval: None,
            items: 0,
        }
    }

    fn grow_extents(&mut self, bbox: Option<[f64; 4]>, interval: Option<(NaiveDateTime, NaiveDateTime)>) {
        if let Some(b) = bbox {
            self.bbox = Some(match self.bbox {
                None => b,
                Some(prev) => [
                    prev[0].min(b[0]),
                    prev[1].min(b[1]),
                    prev[2].max(b[2]),
                    prev[3].max(b[3]),
                ],
            });
        }
        if let Some((start, end)) = interval {
            self.interval = Some(match self.interval {
                None => (start, end),
                Some((s, e)) => (s.min(start), e.max(end)),
            });
        }
    }

    fn item_json(&self, doc: &Document, item_id: &str) -> Value {
        let bbox = doc
            .get("bbox")
            .map(|v| render_scalar(v))
            .and_then(|v| parse_envelope(&v));
        let interval = doc
            .get("time")
            .map(|v| render_scalar(v))
            .and_then(|v| parse_time_interval(&v));

        let [min_lon, min_lat, max_lon, max_lat] = bbox.unwrap_or([-180.0, -90.0, 180.0, 90.0]);
        let geometry = json!({
            "type": "Polygon",
            "coordinates": [[
                [min_lon, min_lat],
                [max_lon, min_lat],
                [max_lon, max_lat],
                [min_lon, max_lat],
                [min_lon, min_lat],
            ]],
        });

        let mut properties = serde_json::Map::new();
        match interval {
            Some((start, end)) => {
                properties.insert("datetime".to_string(), json!(fmt_utc(start)));
                properties.insert("start_datetime".to_string(), json!(fmt_utc(start)));
                properties.insert("end_datetime".to_string(), json!(fmt_utc(end)));
            }
            None => {
                properties.insert("datetime".to_string(), Value::Null);
            }
        }
        for facet in models::facet_hierarchy() {
            if let Some(value) = doc.get(*facet) {
                properties.insert(facet.to_string(), json!(render_scalar(value)));
            }
        }

        let href = doc
            .get(self.uniq_key.as_str())
            .map(|v| render_scalar(v))
            .unwrap_or_default();

        json!({
            "type": "Feature",
            "stac_version": STAC_VERSION,
            "id": item_id,
            "geometry": geometry,
            "bbox": [min_lon, min_lat, max_lon, max_lat],
            "properties": properties,
            "collection": self.collection_id,
            "links": [
                {"rel": "collection", "href": "../collection.json", "type": "application/json"},
                {"rel": "root", "href": "../../../catalog.json", "type": "application/json"},
            ],
            "assets": {
                "data": {
                    "href": href,
                    "type": "application/netcdf",
                    "roles": ["data"],
                }
            },
        })
    }

    fn catalog_json(&self) -> Value {
        json!({
            "type": "Catalog",
            "id": "floe-stac",
            "stac_version": STAC_VERSION,
            "description": "Static STAC catalogue generated from a floe databrowser search.",
            "links": [
                {"rel": "self", "href": "./catalog.json", "type": "application/json"},
                {"rel": "root", "href": "./catalog.json", "type": "application/json"},
                {
                    "rel": "child",
                    "href": format!("./collections/{}/collection.json", self.collection_id),
                    "type": "application/json",
                },
            ],
        })
    }

    fn collection_json(&self) -> Value {
        let bbox = self.bbox.unwrap_or([-180.0, -90.0, 180.0, 90.0]);
        let interval = match self.interval {
            Some((start, end)) => json!([[fmt_utc(start), fmt_utc(end)]]),
            None => json!([[Value::Null, Value::Null]]),
        };
        json!({
            "type": "Collection",
            "id": self.collection_id,
            "stac_version": STAC_VERSION,
            "description": format!("Search results ({} items).", self.items),
            "license": "proprietary",
            "extent": {
                "spatial": {"bbox": [bbox]},
                "temporal": {"interval": interval},
            },
            "links": [
                {"rel": "root", "href": "../../catalog.json", "type": "application/json"},
                {"rel": "parent", "href": "../../catalog.json", "type": "application/json"},
            ],
        })
    }

    /// Drain the document stream into the finished zip archive.
    pub async fn into_zip(
        mut self,
        mut docs: BoxStream<'_, Result<Document, SearchError>>,
    ) -> Result<Vec<u8>, SearchError> {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::default();
        let failed = |e: zip::result::ZipError| SearchError::Internal(e.to_string());
        let io_failed = |e: std::io::Error| SearchError::Internal(e.to_string());

        zip.start_file("stac-catalog/catalog.json", options)
            .map_err(failed)?;
        zip.write_all(serde_json::to_string_pretty(&self.catalog_json()).unwrap().as_bytes())
            .map_err(io_failed)?;

        while let Some(doc) = docs.next().await {
            let doc = doc?;
            let uniq = doc
                .get(self.uniq_key.as_str())
                .map(|v| render_scalar(v))
                .unwrap_or_default();
            let item_id = normalize_id(&uniq);
            if item_id.is_empty() {
                continue;
            }
            let bbox = doc
                .get("bbox")
                .map(|v| render_scalar(v))
                .and_then(|v| parse_envelope(&v));
            let interval = doc
                .get("time")
                .map(|v| render_scalar(v))
                .and_then(|v| parse_time_interval(&v));
            self.grow_extents(bbox, interval);
            self.items += 1;

            let item = self.item_json(&doc, &item_id);
            zip.start_file(
                format!(
                    "stac-catalog/collections/{}/items/{item_id}.json",
                    self.collection_id
                ),
                options,
            )
            .map_err(failed)?;
            zip.write_all(serde_json::to_string_pretty(&item).unwrap().as_bytes())
                .map_err(io_failed)?;
        }

        zip.start_file(
            format!(
                "stac-catalog/collections/{}/collection.json",
                self.collection_id
            ),
            options,
        )
        .map_err(failed)?;
        zip.write_all(
            serde_json::to_string_pretty(&self.collection_json())
                .unwrap()
                .as_bytes(),
        )
        .map_err(io_failed)?;

        let cursor = zip.finish().map_err(failed)?;
        Ok(cursor.into_inner())
    }
}

fn fmt_utc(value: NaiveDateTime) -> String {
    format!("{}Z", value.format("%Y-%m-%dT%H:%M:%S"))
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    fn doc(pairs: &[(&str, &str)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    #[test]
    fn interval_and_envelope_parse() {
        let (start, end) =
            parse_time_interval("[1850-01-01T00:00:00Z TO 1900-12-31T23:59:59Z]").unwrap();
        assert_eq!(start.to_string(), "1850-01-01 00:00:00");
        assert_eq!(end.to_string(), "1900-12-31 23:59:59");

        let bbox = parse_envelope("ENVELOPE(-10.5, 20.0, 60.0, 40.0)").unwrap();
        assert_eq!(bbox, [-10.5, 40.0, 20.0, 60.0]);
        assert!(parse_envelope("POINT(0 0)").is_none());
    }

    #[tokio::test]
    async fn zip_holds_catalog_collection_and_items() {
        let docs = futures::stream::iter(vec![
            Ok(doc(&[
                ("file", "/arch/tas_1850.nc"),
                ("time", "[1850-01-01T00:00:00 TO 1860-12-31T23:59:59]"),
                ("bbox", "ENVELOPE(-180, 180, 90, -90)"),
                ("project", "cmip6"),
            ])),
            Ok(doc(&[
                ("file", "/arch/tas_1870.nc"),
                ("time", "[1870-01-01T00:00:00 TO 1880-12-31T23:59:59]"),
            ])),
        ])
        .boxed();

        let stac = StacCatalogue::new("Dataset-test", UniqKey::File);
        let bytes = stac.into_zip(docs).await.unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"stac-catalog/catalog.json".to_string()));
        assert!(names
            .contains(&"stac-catalog/collections/Dataset-test/collection.json".to_string()));
        assert_eq!(
            names
                .iter()
                .filter(|n| n.contains("/items/"))
                .count(),
            2
        );

        // The collection extent covers both items.
        let mut buf = String::new();
        {
            use std::io::Read;
            archive
                .by_name("stac-catalog/collections/Dataset-test/collection.json")
                .unwrap()
                .read_to_string(&mut buf)
                .unwrap();
        }
        let collection: Value = serde_json::from_str(&buf).unwrap();
        assert_eq!(
            collection["extent"]["temporal"]["interval"][0][1],
            "1880-12-31T23:59:59Z"
        );
        assert_eq!(collection["type"], "Collection");
    }
}
