//! Callsign candidate generation for route lookups.
//!
//! An ADS-B callsign ("BAW0001") may be filed under a different form in a
//! route table ("BAW1", "BA1"). `candidates` lists the forms to try, most
//! specific first, and `find_first` walks them with a caller-supplied lookup,
//! stopping at the first hit.

// ---------------------------------------------------------------------------
// Airline prefixes
// ---------------------------------------------------------------------------

/// Airline ICAO prefix and its IATA equivalent.
const AIRLINE_CODES: &[(&str, &str)] = &[
    ("AAL", "AA"),
    ("DAL", "DL"),
    ("UAL", "UA"),
    ("SWA", "WN"),
    ("JBU", "B6"),
    ("ASA", "AS"),
    ("HAL", "HA"),
    ("SKW", "OO"),
    ("UPS", "5X"),
    ("FDX", "FX"),
    ("ACA", "AC"),
    ("WJA", "WS"),
    ("BAW", "BA"),
    ("DLH", "LH"),
    ("AFR", "AF"),
    ("KLM", "KL"),
    ("EZY", "U2"),
    ("RYR", "FR"),
    ("VIR", "VS"),
    ("EIN", "EI"),
];

/// Split "BAW0001" into ("BAW", "0001"). The prefix is the leading letters
/// (two or three); the remainder must start with a digit.
fn split_callsign(callsign: &str) -> Option<(String, String)> {
    let cs = callsign.trim().to_ascii_uppercase();
    let letters = cs.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
    if !(2..=3).contains(&letters) || letters == cs.len() {
        return None;
    }
    let (prefix, number) = cs.split_at(letters);
    if !number.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    Some((prefix.to_string(), number.to_string()))
}

fn alternate_prefix(prefix: &str) -> Option<&'static str> {
    AIRLINE_CODES.iter().find_map(|(icao, iata)| {
        if *icao == prefix {
            Some(*iata)
        } else if *iata == prefix {
            Some(*icao)
        } else {
            None
        }
    })
}

/// Ordered, de-duplicated callsign forms to try in a route lookup.
///
/// Empty input yields no candidates; an unrecognised shape yields only the
/// normalised callsign itself.
pub fn candidates(callsign: &str) -> Vec<String> {
    let normalized = callsign.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut result = vec![normalized.clone()];
    let Some((prefix, number)) = split_callsign(&normalized) else {
        return result;
    };

    let stripped = number.trim_start_matches('0');
    let stripped = if stripped.is_empty() { "0" } else { stripped };

    let mut push = |s: String| {
        if !result.contains(&s) {
            result.push(s);
        }
    };
    push(format!("{prefix}{stripped}"));
    if let Some(alt) = alternate_prefix(&prefix) {
        push(format!("{alt}{number}"));
        push(format!("{alt}{stripped}"));
    }

    result
}

/// Try each candidate in order and return the first that `lookup` resolves.
///
/// `lookup` is never called again once it has returned `Some`.
pub fn find_first<T, I, S>(candidates: I, mut lookup: impl FnMut(&str) -> Option<T>) -> Option<(String, T)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    candidates.into_iter().find_map(|candidate| {
        let candidate = candidate.as_ref();
        lookup(candidate).map(|found| (candidate.to_string(), found))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
