//! PostgreSQL identifier handling shared by every module that builds SQL.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("static regex"))
}

/// Lowercase, starts with a letter or underscore, at most 63 bytes.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// Double-quote an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"namespace"."table"`
pub fn qualified(namespace: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(namespace), quote_ident(table))
}
