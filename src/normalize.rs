use crate::models::LineId;

const PURPLE_TERMINUS: &str = "KR Pura";
const YELLOW_TERMINUS: &str = "Silk Board";

/// Maps free-text destination names onto a corridor.
///
/// Purple is checked first so a destination naming both termini resolves to
/// Purple. Used for both static rows and live records.
pub fn normalize_destination(raw: Option<&str>) -> LineId {
    let text = raw.map(str::trim).unwrap_or_default();

    if text.is_empty() {
        LineId::Unknown
    } else if text.contains(PURPLE_TERMINUS) {
        LineId::Purple
    } else if text.contains(YELLOW_TERMINUS) {
        LineId::Yellow
    } else {
        LineId::Unknown
    }
}
