//! Engine classification and create-statement rewriting.

use regex::Regex;
use std::sync::OnceLock;

/// Databases whose tables live outside ClickHouse and are never backed up
const EXTERNAL_DB_ENGINES: &[&str] = &["MySQL", "MaterializedMySQL", "PostgreSQL", "MaterializedPostgreSQL"];

pub fn is_merge_tree(engine: &str) -> bool {
    engine.ends_with("MergeTree")
}

pub fn is_replicated(engine: &str) -> bool {
    engine.starts_with("Replicated") && is_merge_tree(engine)
}

pub fn is_distributed(engine: &str) -> bool {
    engine == "Distributed"
}

pub fn is_view(engine: &str) -> bool {
    matches!(engine, "View" | "MaterializedView" | "LiveView" | "WindowView")
}

pub fn is_external_db_engine(engine: &str) -> bool {
    EXTERNAL_DB_ENGINES.contains(&engine)
}

/// Position of a table in the restore sequence: storage tables first,
/// tables referencing them next, views last.
pub fn restore_priority(engine: &str) -> u8 {
    if is_merge_tree(engine) {
        0
    } else if is_distributed(engine) {
        2
    } else if is_view(engine) {
        3
    } else {
        1
    }
}

fn replica_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(Replicated\w*MergeTree\(\s*'[^']*'\s*,\s*)'[^']*'").expect("replica regex is valid")
    })
}

/// Substitute the replica name argument of a `Replicated*MergeTree` engine.
/// Statements without explicit engine arguments are returned unchanged.
pub fn override_replica_name(create_statement: &str, replica: &str) -> String {
    let escaped = replica.replace('\\', "\\\\").replace('\'', "\\'");
    replica_regex()
        .replace(create_statement, |caps: &regex::Captures| format!("{}'{}'", &caps[1], escaped))
        .into_owned()
}

/// Compare two create statements ignoring the formatting differences
/// between `SHOW CREATE` output and on-disk `ATTACH` metadata.
pub fn compare_schema(a: &str, b: &str) -> bool {
    normalize_schema(a) == normalize_schema(b)
}

fn normalize_schema(schema: &str) -> String {
    static DISTRIBUTED: OnceLock<Regex> = OnceLock::new();
    static ATTACH: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let distributed = DISTRIBUTED.get_or_init(|| {
        Regex::new(r"ENGINE = Distributed\('([^']+)', ('?)(\w+)'?, ('?)(\w+)'?(, .*)?\)")
            .expect("distributed regex is valid")
    });
    let attach = ATTACH.get_or_init(|| {
        Regex::new(r"^attach table `?([^`.]+)`?\.`?([^`.\s]+)`?( uuid '[^']+')?")
            .expect("attach regex is valid")
    });
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("spaces regex is valid"));

    let res = distributed
        .replace_all(schema, "ENGINE = Distributed('$1', '$3', '$5'$6)")
        .to_lowercase();
    let res = spaces.replace_all(&res, " ");
    let res = attach.replace(res.trim(), "create table $1.$2");
    let res = res.replace("create table `", "create table ");

    res.replace("( ", "(").replace(" )", ")").trim().to_string()
}

/// Quote an identifier for use in DDL.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Quote a string literal.
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_classification() {
        assert!(is_merge_tree("ReplicatedReplacingMergeTree"));
        assert!(is_replicated("ReplicatedMergeTree"));
        assert!(!is_replicated("MergeTree"));
        assert!(is_view("MaterializedView"));
        assert!(is_external_db_engine("MaterializedPostgreSQL"));
        assert!(!is_external_db_engine("Atomic"));

        let mut engines = vec!["View", "Distributed", "Log", "MergeTree"];
        engines.sort_by_key(|e| restore_priority(e));
        assert_eq!(engines, vec!["MergeTree", "Log", "Distributed", "View"]);
    }

    #[test]
    fn test_override_replica_name() {
        let stmt = "CREATE TABLE db.t (n UInt32) ENGINE = ReplicatedMergeTree('/clickhouse/tables/{shard}/t', 'clickhouse01') ORDER BY n";
        let rewritten = override_replica_name(stmt, "{replica}");
        assert_eq!(
            rewritten,
            "CREATE TABLE db.t (n UInt32) ENGINE = ReplicatedMergeTree('/clickhouse/tables/{shard}/t', '{replica}') ORDER BY n"
        );

        let plain = "CREATE TABLE db.t (n UInt32) ENGINE = MergeTree ORDER BY n";
        assert_eq!(override_replica_name(plain, "r2"), plain);
    }

    #[test]
    fn test_override_keeps_extra_engine_arguments() {
        let stmt = "ENGINE = ReplicatedReplacingMergeTree('/p', 'old', ver) ORDER BY id";
        assert_eq!(
            override_replica_name(stmt, "new"),
            "ENGINE = ReplicatedReplacingMergeTree('/p', 'new', ver) ORDER BY id"
        );
    }

    #[test]
    fn test_compare_schema_ignores_formatting() {
        let attach = "ATTACH TABLE `db`.`t` UUID 'b0a8c7d6-0000-4000-8000-000000000000'\n(\n    `n` UInt32\n)\nENGINE = MergeTree\nORDER BY n\n";
        let create = "CREATE TABLE db.t (`n` UInt32) ENGINE = MergeTree ORDER BY n";
        assert!(compare_schema(attach, create));

        let other = "CREATE TABLE db.t (`n` UInt64) ENGINE = MergeTree ORDER BY n";
        assert!(!compare_schema(create, other));
    }

    #[test]
    fn test_compare_schema_distributed_quoting() {
        let old = "CREATE TABLE db.d (n UInt32) ENGINE = Distributed('cluster', db, t, rand())";
        let new = "CREATE TABLE db.d (n UInt32) ENGINE = Distributed('cluster', 'db', 't', rand())";
        assert!(compare_schema(old, new));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
        assert_eq!(quote_str("it's"), "'it\\'s'");
    }
}
