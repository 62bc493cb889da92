//! intake-esm catalogue assembly: a header object followed by a streamed
//! `catalog_dict` array.

use crate::{render_scalar, Document, SearchError};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use models::{
    AggregationControl, IntakeAggregation, IntakeAssets, IntakeAttribute, IntakeHeader,
    Translator, UniqKey,
};
use std::sync::Arc;

/// The catalogue header plus the total result count it covers.
#[derive(Debug, Clone)]
pub struct IntakeCatalogue {
    pub catalogue: IntakeHeader,
    pub total_count: u64,
}

pub fn intake_header(translator: &Translator, uniq_key: UniqKey, facets: &[String]) -> IntakeHeader {
    IntakeHeader {
        esmcat_version: "0.1.0".to_string(),
        attributes: facets
            .iter()
            .map(|facet| IntakeAttribute {
                column_name: facet.clone(),
                vocabulary: String::new(),
            })
            .collect(),
        assets: IntakeAssets {
            column_name: uniq_key.as_str().to_string(),
            format_column_name: "format".to_string(),
        },
        id: "floe".to_string(),
        description: "Catalogue from the floe databrowser".to_string(),
        title: "floe databrowser catalogue".to_string(),
        last_updated: chrono::Utc::now().to_rfc3339(),
        aggregation_control: AggregationControl {
            variable_column_name: translator.forward("variable"),
            groupby_attrs: Vec::new(),
            aggregations: facets
                .iter()
                .map(|facet| IntakeAggregation {
                    kind: "union".to_string(),
                    attribute_name: facet.clone(),
                    options: serde_json::Map::new(),
                })
                .collect(),
        },
    }
}

/// Project a result document onto the catalogue entry: the uniq key plus the
/// facet hierarchy, single-element lists collapsed to scalars.
pub(crate) fn catalogue_entry(
    doc: &Document,
    uniq_key: UniqKey,
    rewrite: Option<&(dyn Fn(&str) -> String + Send + Sync)>,
) -> Document {
    let mut entry = Document::new();
    let mut keys: Vec<&str> = vec![uniq_key.as_str()];
    keys.extend(models::facet_hierarchy());
    for key in keys {
        let Some(value) = doc.get(key) else { continue };
        let value = match value {
            serde_json::Value::Array(items) if items.len() == 1 => items[0].clone(),
            other => other.clone(),
        };
        if key == uniq_key.as_str() {
            if let Some(rewrite) = rewrite {
                entry.insert(
                    key.to_string(),
                    serde_json::Value::from(rewrite(&render_scalar(&value))),
                );
                continue;
            }
        }
        entry.insert(key.to_string(), value);
    }
    entry
}

/// Stream the catalogue JSON: the header minus its closing brace, then the
/// `catalog_dict` array entry by entry, then the closing braces.
pub(crate) fn stream_catalogue(
    catalogue: IntakeCatalogue,
    docs: BoxStream<'static, Result<Document, SearchError>>,
    uniq_key: UniqKey,
    rewrite: Option<Arc<dyn Fn(&str) -> String + Send + Sync>>,
) -> BoxStream<'static, Result<Bytes, SearchError>> {
    let header = serde_json::to_string_pretty(&catalogue.catalogue)
        .expect("intake header always serializes");
    let head = header
        .trim_end()
        .trim_end_matches('}')
        .trim_end()
        .to_string();

    let opening = futures::stream::iter(vec![Ok::<Bytes, SearchError>(Bytes::from(format!(
        "{head},\n  \"catalog_dict\": ["
    )))]);
    let entries = docs
        .enumerate()
        .map(move |(idx, doc)| {
            let doc = doc?;
            let entry = catalogue_entry(&doc, uniq_key, rewrite.as_deref());
            let body = serde_json::to_string_pretty(&entry)
                .map_err(|e| SearchError::Internal(e.to_string()))?;
            let separator = if idx == 0 { "" } else { "," };
            let indented = body.replace('\n', "\n    ");
            Ok(Bytes::from(format!("{separator}\n    {indented}")))
        })
        .boxed();
    let closing =
        futures::stream::iter(vec![Ok::<Bytes, SearchError>(Bytes::from("\n  ]\n}".to_string()))]);

    opening.chain(entries).chain(closing).boxed()
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::TryStreamExt;
    use models::Flavour;

    fn doc(pairs: &[(&str, &str)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    #[test]
    fn header_carries_the_variable_column() {
        let translator = Translator::builtin(Flavour::Cmip6, true);
        let header = intake_header(&translator, UniqKey::Uri, &["mip_era".to_string()]);
        assert_eq!(header.aggregation_control.variable_column_name, "variable_id");
        assert_eq!(header.assets.column_name, "uri");
        assert_eq!(header.attributes[0].column_name, "mip_era");
    }

    #[tokio::test]
    async fn streamed_catalogue_is_valid_json() {
        let translator = Translator::builtin(Flavour::Freva, true);
        let catalogue = IntakeCatalogue {
            catalogue: intake_header(&translator, UniqKey::File, &["project".to_string()]),
            total_count: 2,
        };
        let docs = futures::stream::iter(vec![
            Ok(doc(&[("file", "/a.nc"), ("project", "cmip6")])),
            Ok(doc(&[("file", "/b.nc"), ("project", "cmip6")])),
        ])
        .boxed();

        let bytes: Vec<Bytes> = stream_catalogue(catalogue, docs, UniqKey::File, None)
            .try_collect()
            .await
            .unwrap();
        let text: String = bytes.iter().map(|b| String::from_utf8_lossy(b)).collect();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["catalog_dict"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["catalog_dict"][0]["file"], "/a.nc");
        assert_eq!(parsed["esmcat_version"], "0.1.0");
    }

    #[tokio::test]
    async fn rewrite_maps_assets_to_zarr_urls() {
        let translator = Translator::builtin(Flavour::Freva, true);
        let catalogue = IntakeCatalogue {
            catalogue: intake_header(&translator, UniqKey::Uri, &[]),
            total_count: 1,
        };
        let docs =
            futures::stream::iter(vec![Ok(doc(&[("uri", "/a.nc")]))]).boxed();
        let rewrite: Arc<dyn Fn(&str) -> String + Send + Sync> =
            Arc::new(|uri| format!("https://host/zarr/{}.zarr", uri.len()));

        let bytes: Vec<Bytes> =
            stream_catalogue(catalogue, docs, UniqKey::Uri, Some(rewrite))
                .try_collect()
                .await
                .unwrap();
        let text: String = bytes.iter().map(|b| String::from_utf8_lossy(b)).collect();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["catalog_dict"][0]["uri"], "https://host/zarr/5.zarr");
    }
}
