/// Protocol version string carried in every [`crate::Command`] and
/// stamped onto every [`crate::Notify`].
///
/// The backend drops commands whose version does not match unless the
/// frontend sets `allow_version_skew`.
pub const LONG: &str = env!("CARGO_PKG_VERSION");
