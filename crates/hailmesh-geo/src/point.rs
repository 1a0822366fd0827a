//! Geographic points and taxi identities.

use std::cmp::Ordering;
use std::fmt;

/// Maximum length of a taxi (or customer) identity in bytes.
///
/// Longer identities are truncated, matching what the wire decoder does.
pub const MAX_ID_LEN: usize = 20;

/// A latitude/longitude pair.
///
/// Distances are plain coordinate deltas: the index compares each axis
/// independently against a bias, so a "radius" is really a box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Both coordinates are finite (no NaN, no infinities).
    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }

    /// Check if `other` lies inside the box of half-width `bias` centred on `self`.
    ///
    /// The comparison is inclusive on both axes.
    pub fn within(&self, other: &GeoPoint, bias: f64) -> bool {
        (self.latitude - other.latitude).abs() <= bias
            && (self.longitude - other.longitude).abs() <= bias
    }

    /// Lexicographic (latitude, longitude) ordering used for cluster member arrays.
    pub fn position_cmp(&self, other: &GeoPoint) -> Ordering {
        self.latitude
            .partial_cmp(&other.latitude)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                self.longitude
                    .partial_cmp(&other.longitude)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.latitude, self.longitude)
    }
}

/// Opaque taxi or customer identity, at most [`MAX_ID_LEN`] bytes.
///
/// The encoding is caller-defined; an empty identity is valid and is used
/// by location-only records such as fetch requests.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaxiId(Vec<u8>);

impl TaxiId {
    /// Create an identity from raw bytes, truncating to [`MAX_ID_LEN`].
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        let len = bytes.len().min(MAX_ID_LEN);
        Self(bytes[..len].to_vec())
    }

    /// The empty identity.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for TaxiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => write!(f, "0x{}", self.to_hex()),
        }
    }
}

impl fmt::Debug for TaxiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaxiId({})", self)
    }
}

impl From<&str> for TaxiId {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for TaxiId {
    fn from(s: String) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<&[u8]> for TaxiId {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for TaxiId {
    fn from(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(MAX_ID_LEN);
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_is_inclusive_on_both_axes() {
        let centre = GeoPoint::new(1.0, 1.0);
        assert!(centre.within(&GeoPoint::new(1.25, 1.25), 0.25));
        assert!(centre.within(&GeoPoint::new(0.75, 0.75), 0.25));
        assert!(!centre.within(&GeoPoint::new(1.25, 1.5), 0.25));
    }

    #[test]
    fn within_is_a_box_not_a_circle() {
        let centre = GeoPoint::new(0.0, 0.0);
        // Corner of the box is ~0.35 away but still inside.
        assert!(centre.within(&GeoPoint::new(0.25, -0.25), 0.25));
    }

    #[test]
    fn position_order_breaks_ties_on_longitude() {
        let a = GeoPoint::new(1.0, 2.0);
        let b = GeoPoint::new(1.0, 3.0);
        let c = GeoPoint::new(0.5, 9.0);
        assert_eq!(a.position_cmp(&b), Ordering::Less);
        assert_eq!(b.position_cmp(&a), Ordering::Greater);
        assert_eq!(c.position_cmp(&a), Ordering::Less);
        assert_eq!(a.position_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn ids_are_truncated() {
        let id = TaxiId::new(b"abcdefghijklmnopqrstuvwxyz");
        assert_eq!(id.len(), MAX_ID_LEN);
        assert_eq!(id.as_bytes(), b"abcdefghijklmnopqrst");

        let id = TaxiId::from(vec![7u8; 32]);
        assert_eq!(id.len(), MAX_ID_LEN);
    }

    #[test]
    fn display_falls_back_to_hex() {
        assert_eq!(TaxiId::from("cab-42").to_string(), "cab-42");
        assert_eq!(TaxiId::new([0u8, 1, 2]).to_string(), "0x000102");
        assert_eq!(TaxiId::empty().to_string(), "");
    }
}
