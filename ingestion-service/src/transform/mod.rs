pub mod normalize;
pub mod tank;

pub use normalize::{
    normalize_poll_response, normalize_push, parse_timestamp, DefectKind, FieldMap, NormalizeError,
    NormalizedFrame, ReadingDefect, POLL_FIELDS, PUSH_FIELDS,
};
pub use tank::{GeometryError, TankGeometry};
