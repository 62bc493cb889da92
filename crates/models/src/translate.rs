use crate::facets::{canonical_facets, Relevance, CORDEX_KEYS};
use crate::flavour::Flavour;
use indexmap::IndexMap;

/// Maps the canonical facet vocabulary to a flavour's display vocabulary and
/// back. Inbound query keys are translated backwards to canonical form before
/// query assembly, outbound facet dictionaries forwards after the index
/// responds. With `translate == false` both directions are the identity.
#[derive(Debug, Clone)]
pub struct Translator {
    pub flavour: String,
    pub translate: bool,
    forward: IndexMap<String, String>,
    backward: IndexMap<String, String>,
    cordex: bool,
}

fn identity_lookup() -> IndexMap<String, String> {
    canonical_facets()
        .iter()
        .map(|(k, _)| (k.to_string(), k.to_string()))
        .collect()
}

fn builtin_lookup(flavour: Flavour) -> IndexMap<String, String> {
    let renames: &[(&str, &str)] = match flavour {
        Flavour::Freva | Flavour::User => &[],
        Flavour::Cmip6 => &[
            ("experiment", "experiment_id"),
            ("ensemble", "member_id"),
            ("institute", "institution_id"),
            ("model", "source_id"),
            ("project", "mip_era"),
            ("product", "activity_id"),
            ("time_frequency", "frequency"),
            ("cmor_table", "table_id"),
            ("variable", "variable_id"),
        ],
        Flavour::Cmip5 => &[
            ("ensemble", "member_id"),
            ("institute", "institution_id"),
            ("model", "model_id"),
        ],
        Flavour::Cordex => &[("institute", "institution"), ("product", "domain")],
    };
    let mut lookup = identity_lookup();
    for (canonical, display) in renames {
        lookup.insert(canonical.to_string(), display.to_string());
    }
    lookup
}

impl Translator {
    pub fn builtin(flavour: Flavour, translate: bool) -> Self {
        Self::from_lookup(
            flavour.as_str(),
            builtin_lookup(flavour),
            translate,
            flavour == Flavour::Cordex,
        )
    }

    /// A custom flavour: the identity mapping overlaid with the user's
    /// canonical → display renames.
    pub fn custom(name: &str, mapping: &IndexMap<String, String>, translate: bool) -> Self {
        let mut lookup = identity_lookup();
        for (canonical, display) in mapping {
            lookup.insert(canonical.clone(), display.clone());
        }
        Self::from_lookup(name, lookup, translate, false)
    }

    fn from_lookup(
        flavour: &str,
        forward: IndexMap<String, String>,
        translate: bool,
        cordex: bool,
    ) -> Self {
        let backward = forward.iter().map(|(k, v)| (v.clone(), k.clone())).collect();
        Self {
            flavour: flavour.to_string(),
            translate,
            forward,
            backward,
            cordex,
        }
    }

    pub fn forward_lookup(&self) -> &IndexMap<String, String> {
        &self.forward
    }

    pub fn backward_lookup(&self) -> &IndexMap<String, String> {
        &self.backward
    }

    /// The display name of one canonical facet.
    pub fn forward(&self, canonical: &str) -> String {
        if !self.translate {
            return canonical.to_string();
        }
        self.forward
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    /// The canonical name of one display facet.
    pub fn backward(&self, display: &str) -> String {
        if !self.translate {
            return display.to_string();
        }
        self.backward
            .get(display)
            .cloned()
            .unwrap_or_else(|| display.to_string())
    }

    /// The facet names a query against this flavour may use.
    pub fn valid_facets(&self) -> Vec<String> {
        if self.translate {
            self.forward.values().cloned().collect()
        } else {
            self.forward.keys().cloned().collect()
        }
    }

    pub fn primary_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = canonical_facets()
            .iter()
            .filter(|(_, relevance)| *relevance == Relevance::Primary)
            .map(|(k, _)| {
                if self.translate {
                    self.forward(k)
                } else {
                    k.to_string()
                }
            })
            .collect();
        if self.cordex {
            keys.extend(CORDEX_KEYS.iter().map(|k| k.to_string()));
        }
        keys
    }

    pub fn translate_facets<'a, I>(&self, facets: I, backwards: bool) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        facets
            .into_iter()
            .map(|f| {
                if backwards {
                    self.backward(f)
                } else {
                    self.forward(f)
                }
            })
            .collect()
    }

    pub fn translate_query<V>(
        &self,
        query: IndexMap<String, V>,
        backwards: bool,
    ) -> IndexMap<String, V> {
        query
            .into_iter()
            .map(|(k, v)| {
                let k = if backwards {
                    self.backward(&k)
                } else {
                    self.forward(&k)
                };
                (k, v)
            })
            .collect()
    }

    /// Attribute names shown by the overview endpoint: the full display
    /// vocabulary, minus the CORDEX-only keys for non-cordex flavours.
    pub fn overview_attributes(&self) -> Vec<String> {
        self.forward
            .values()
            .filter(|v| self.cordex || !CORDEX_KEYS.contains(&v.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forward_and_backward_are_inverse() {
        for flavour in Flavour::ALL {
            let translator = Translator::builtin(*flavour, true);
            for (canonical, display) in translator.forward_lookup() {
                assert_eq!(
                    translator.backward_lookup().get(display),
                    Some(canonical),
                    "{flavour}: {canonical} -> {display} must invert"
                );
            }
        }
    }

    #[test]
    fn cmip6_renames_apply() {
        let translator = Translator::builtin(Flavour::Cmip6, true);
        assert_eq!(translator.forward("project"), "mip_era");
        assert_eq!(translator.forward("product"), "activity_id");
        assert_eq!(translator.backward("variable_id"), "variable");
        // Untouched facets pass through.
        assert_eq!(translator.forward("realm"), "realm");
    }

    #[test]
    fn translate_false_is_identity() {
        let translator = Translator::builtin(Flavour::Cmip6, false);
        assert_eq!(translator.forward("project"), "project");
        assert_eq!(translator.backward("mip_era"), "mip_era");
        assert!(translator.valid_facets().contains(&"project".to_string()));
    }

    #[test]
    fn cordex_gains_primary_keys() {
        let cordex = Translator::builtin(Flavour::Cordex, true);
        for key in CORDEX_KEYS {
            assert!(cordex.primary_keys().contains(&key.to_string()));
        }
        let freva = Translator::builtin(Flavour::Freva, true);
        assert!(!freva.primary_keys().contains(&"rcm_name".to_string()));
        assert!(!freva
            .overview_attributes()
            .contains(&"rcm_name".to_string()));
    }

    #[test]
    fn custom_flavour_overlays_identity() {
        let mapping: IndexMap<String, String> =
            [("project".to_string(), "mip_era".to_string())].into_iter().collect();
        let translator = Translator::custom("nextgem", &mapping, true);
        assert_eq!(translator.forward("project"), "mip_era");
        assert_eq!(translator.forward("model"), "model");
        assert_eq!(translator.backward("mip_era"), "project");
    }
}
