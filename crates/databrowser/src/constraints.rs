//! Parsing of the special `time` and `bbox` search facets into
//! backend-agnostic constraints.

use crate::SearchError;
use chrono::{Datelike, NaiveDate, NaiveDateTime};

/// How a constraint selects against the indexed interval, mapped onto the
/// index's spatial operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMethod {
    Strict,
    Flexible,
    File,
}

impl SelectMethod {
    pub fn parse(kind: &str, value: &str) -> Result<Self, SearchError> {
        match value.to_lowercase().as_str() {
            "strict" => Ok(SelectMethod::Strict),
            "flexible" => Ok(SelectMethod::Flexible),
            "file" => Ok(SelectMethod::File),
            _ => Err(SearchError::Constraint(format!(
                "Choose `{kind}` from strict, flexible, file"
            ))),
        }
    }

    pub fn operator(&self) -> &'static str {
        match self {
            SelectMethod::Strict => "Within",
            SelectMethod::Flexible => "Intersects",
            SelectMethod::File => "Contains",
        }
    }
}

/// A half-open time interval with its selection method.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub method: SelectMethod,
}

const MIN_START: &str = "0001-01-01T00:00:00";
const MAX_END: &str = "9999-12-31T23:59:59";

fn min_start() -> NaiveDateTime {
    NaiveDateTime::parse_from_str(MIN_START, "%Y-%m-%dT%H:%M:%S").unwrap()
}

fn max_end() -> NaiveDateTime {
    NaiveDateTime::parse_from_str(MAX_END, "%Y-%m-%dT%H:%M:%S").unwrap()
}

fn last_day_of(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.unwrap().pred_opt().unwrap().day()
}

/// Parse one `YYYY[-MM[-DD[THH:MM]]]` timestamp into the interval it spans:
/// a bare year covers the whole year, a month the whole month, and so on.
fn parse_partial(value: &str) -> Result<(NaiveDateTime, NaiveDateTime), SearchError> {
    let bad = || SearchError::Constraint(format!("could not parse time {value:?}"));

    if let Ok(exact) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok((exact, exact));
    }
    if let Ok(minute) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M") {
        return Ok((minute, minute + chrono::Duration::seconds(59)));
    }
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok((
            day.and_hms_opt(0, 0, 0).unwrap(),
            day.and_hms_opt(23, 59, 59).unwrap(),
        ));
    }
    if let Ok(month_start) = NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d") {
        let last = last_day_of(month_start.year(), month_start.month());
        let month_end = NaiveDate::from_ymd_opt(month_start.year(), month_start.month(), last)
            .ok_or_else(bad)?;
        return Ok((
            month_start.and_hms_opt(0, 0, 0).unwrap(),
            month_end.and_hms_opt(23, 59, 59).unwrap(),
        ));
    }
    let year: i32 = value.parse().map_err(|_| bad())?;
    let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(bad)?;
    let end = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(bad)?;
    Ok((
        start.and_hms_opt(0, 0, 0).unwrap(),
        end.and_hms_opt(23, 59, 59).unwrap(),
    ))
}

impl TimeRange {
    /// Accepts `""` (no constraint), a single timestamp, or
    /// `"<start> to <end>"` with either side optional.
    pub fn parse(time: &str, select: &str) -> Result<Option<Self>, SearchError> {
        let method = SelectMethod::parse("time_select", select)?;
        let time: String = time.split_whitespace().collect();
        if time.is_empty() {
            return Ok(None);
        }
        let lowered = time.to_lowercase();
        let (start, end) = match lowered.split_once("to") {
            Some((left, right)) => {
                let start = if left.is_empty() {
                    min_start()
                } else {
                    parse_partial(left)?.0
                };
                let end = if right.is_empty() {
                    max_end()
                } else {
                    parse_partial(right)?.1
                };
                (start, end)
            }
            None => parse_partial(&lowered)?,
        };
        Ok(Some(TimeRange { start, end, method }))
    }

    /// The Solr RPT filter: `{!field f=time op=<Op>}[<start> TO <end>]`.
    pub fn to_solr(&self) -> String {
        format!(
            "{{!field f=time op={}}}[{} TO {}]",
            self.method.operator(),
            self.start.format("%Y-%m-%dT%H:%M:%S"),
            self.end.format("%Y-%m-%dT%H:%M:%S"),
        )
    }
}

/// An axis-aligned bounding box with its selection method.
#[derive(Debug, Clone, PartialEq)]
pub struct BBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    pub method: SelectMethod,
}

impl BBox {
    /// Accepts `""` (no constraint) or `minLon,maxLon,minLat,maxLat`.
    pub fn parse(bbox: &str, select: &str) -> Result<Option<Self>, SearchError> {
        let method = SelectMethod::parse("bbox_select", select)?;
        let bbox: String = bbox.split_whitespace().collect();
        if bbox.is_empty() {
            return Ok(None);
        }
        let parts: Vec<&str> = bbox.split(',').collect();
        let [min_lon, max_lon, min_lat, max_lat] = parts.as_slice() else {
            return Err(SearchError::Constraint(format!(
                "Failed to parse bbox string: expected four values, got {}",
                parts.len()
            )));
        };
        let parse = |v: &str| -> Result<f64, SearchError> {
            v.parse()
                .map_err(|_| SearchError::Constraint(format!("Failed to parse bbox string: {v:?}")))
        };
        let (min_lon, max_lon) = (parse(min_lon)?, parse(max_lon)?);
        let (min_lat, max_lat) = (parse(min_lat)?, parse(max_lat)?);
        if !(-180.0..=180.0).contains(&min_lon) || !(-180.0..=180.0).contains(&max_lon) {
            return Err(SearchError::Constraint(
                "Longitude must be between -180 and 180".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(SearchError::Constraint(
                "Latitude must be between -90 and 90".to_string(),
            ));
        }
        Ok(Some(BBox {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            method,
        }))
    }

    /// The Solr RPT filter over an ENVELOPE, `(minLon, maxLon, maxLat, minLat)`.
    pub fn to_solr(&self) -> String {
        format!(
            "bbox:\"{}(ENVELOPE({},{},{},{}))\"",
            self.method.operator(),
            self.min_lon,
            self.max_lon,
            self.max_lat,
            self.min_lat,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_time_is_no_constraint() {
        assert_eq!(TimeRange::parse("", "flexible").unwrap(), None);
        assert_eq!(TimeRange::parse("  ", "strict").unwrap(), None);
    }

    #[test]
    fn bare_year_spans_the_year() {
        let range = TimeRange::parse("1800", "file").unwrap().unwrap();
        assert_eq!(range.method, SelectMethod::File);
        assert_eq!(
            range.to_solr(),
            "{!field f=time op=Contains}[1800-01-01T00:00:00 TO 1800-12-31T23:59:59]"
        );
    }

    #[test]
    fn open_ranges_use_the_epoch_bounds() {
        let range = TimeRange::parse("2000 to", "flexible").unwrap().unwrap();
        assert_eq!(range.start.to_string(), "2000-01-01 00:00:00");
        assert_eq!(range.end.to_string(), "9999-12-31 23:59:59");

        let range = TimeRange::parse("to 2000-02", "flexible").unwrap().unwrap();
        assert_eq!(range.start.to_string(), "0001-01-01 00:00:00");
        assert_eq!(range.end.to_string(), "2000-02-29 23:59:59");
    }

    #[test]
    fn time_select_maps_to_operators() {
        for (select, op) in [("strict", "Within"), ("flexible", "Intersects"), ("file", "Contains")]
        {
            let range = TimeRange::parse("2000", select).unwrap().unwrap();
            assert_eq!(range.method.operator(), op);
        }
        let err = TimeRange::parse("2000", "fuzzy").unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("time_select"));
    }

    #[test]
    fn bbox_validates_ranges() {
        let bbox = BBox::parse("-180,180,-90,90", "flexible").unwrap().unwrap();
        assert_eq!(
            bbox.to_solr(),
            "bbox:\"Intersects(ENVELOPE(-180,180,90,-90))\""
        );
        assert!(BBox::parse("-181,180,-90,90", "flexible").is_err());
        assert!(BBox::parse("-180,180,-90,91", "flexible").is_err());
        assert!(BBox::parse("0,1,2", "flexible").is_err());
        assert_eq!(BBox::parse("", "flexible").unwrap(), None);
    }
}
