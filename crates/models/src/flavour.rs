use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The built-in data reference syntax standards. Custom flavours are layered
/// on top of these by name and are never allowed to shadow them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavour {
    Freva,
    Cmip6,
    Cmip5,
    Cordex,
    User,
}

impl Flavour {
    pub const ALL: &'static [Flavour] = &[
        Flavour::Freva,
        Flavour::Cmip6,
        Flavour::Cmip5,
        Flavour::Cordex,
        Flavour::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Flavour::Freva => "freva",
            Flavour::Cmip6 => "cmip6",
            Flavour::Cmip5 => "cmip5",
            Flavour::Cordex => "cordex",
            Flavour::User => "user",
        }
    }
}

impl std::str::FromStr for Flavour {
    type Err = ParseFlavourError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freva" => Ok(Flavour::Freva),
            "cmip6" => Ok(Flavour::Cmip6),
            "cmip5" => Ok(Flavour::Cmip5),
            "cordex" => Ok(Flavour::Cordex),
            "user" => Ok(Flavour::User),
            other => Err(ParseFlavourError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Flavour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown flavour {0:?}")]
pub struct ParseFlavourError(pub String);

/// Who a custom flavour belongs to. Global flavours are visible to everyone
/// and writable only with the admin claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "name")]
pub enum FlavourOwner {
    Global,
    User(String),
}

impl FlavourOwner {
    pub fn key(&self) -> &str {
        match self {
            FlavourOwner::Global => "global",
            FlavourOwner::User(name) => name,
        }
    }
}

/// A user-defined forward mapping from canonical facet names to display
/// names, uniquely keyed by `(flavour_name, owner)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFlavour {
    pub flavour_name: String,
    pub owner: FlavourOwner,
    pub mapping: IndexMap<String, String>,
}

impl CustomFlavour {
    /// The name under which this flavour is listed. Personal flavours that
    /// collide with a global one of the same name are namespaced as
    /// `username:flavour_name`.
    pub fn listed_name(&self, collides: bool) -> String {
        match (&self.owner, collides) {
            (FlavourOwner::User(user), true) => format!("{user}:{}", self.flavour_name),
            _ => self.flavour_name.clone(),
        }
    }
}

/// Flavour names that loosely match `wanted`, for 422 responses on unknown
/// flavours.
pub fn suggest_flavours<'a, I>(wanted: &str, known: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted = wanted.to_lowercase();
    known
        .into_iter()
        .filter(|k| {
            let k = k.to_lowercase();
            k.contains(&wanted) || wanted.contains(&k)
        })
        .map(|k| k.to_string())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flavour_round_trips_through_str() {
        for flavour in Flavour::ALL {
            assert_eq!(*flavour, flavour.as_str().parse().unwrap());
        }
        assert!("cmipx".parse::<Flavour>().is_err());
    }

    #[test]
    fn suggestions_are_substring_matches() {
        let known = ["freva", "cmip6", "cmip5", "cordex", "user", "nextgems"];
        assert_eq!(suggest_flavours("cmip", known), vec!["cmip6", "cmip5"]);
        assert_eq!(suggest_flavours("nextgems-x", known), vec!["nextgems"]);
        assert!(suggest_flavours("era5", known).is_empty());
    }

    #[test]
    fn personal_flavours_namespace_on_collision() {
        let flavour = CustomFlavour {
            flavour_name: "nextgems".to_string(),
            owner: FlavourOwner::User("janedoe".to_string()),
            mapping: IndexMap::new(),
        };
        assert_eq!(flavour.listed_name(false), "nextgems");
        assert_eq!(flavour.listed_name(true), "janedoe:nextgems");
    }
}
