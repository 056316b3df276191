use chrono::{DateTime, Utc};
use compact_str::CompactString;
use indexmap::IndexSet;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::outcome::{ErrorKind, FetchCode, FetchError};
use crate::record::{
    ApiSymbol, ExclusionEntry, FetchStatus, IndexCursor, LicenseFinding, ModuleRecord,
    ModuleVersion, Package, Readme, SourceInfo,
};
use crate::version;

/// On-disk cap for one module record; beyond it only status is stored.
pub const MAX_RECORD_BYTES: u64 = 100 * 1024 * 1024;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS modules (
    module_path text NOT NULL,
    version text NOT NULL,
    commit_time timestamptz NOT NULL,
    go_mod bytea NOT NULL,
    has_go_mod boolean NOT NULL,
    redistributable boolean NOT NULL,
    readme_path text,
    readme_contents text,
    source_info jsonb,
    PRIMARY KEY (module_path, version)
);

CREATE TABLE IF NOT EXISTS packages (
    module_path text NOT NULL,
    version text NOT NULL,
    import_path text NOT NULL,
    name text NOT NULL,
    synopsis text NOT NULL,
    imports jsonb NOT NULL,
    exported_api jsonb NOT NULL,
    doc_source bytea NOT NULL,
    goos text,
    goarch text,
    PRIMARY KEY (module_path, version, import_path),
    FOREIGN KEY (module_path, version)
        REFERENCES modules (module_path, version) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS packages_name_idx ON packages (name);
CREATE INDEX IF NOT EXISTS packages_import_path_idx ON packages (import_path);

CREATE TABLE IF NOT EXISTS licenses (
    module_path text NOT NULL,
    version text NOT NULL,
    file_path text NOT NULL,
    detected_type text NOT NULL,
    coverage smallint NOT NULL,
    redistributable boolean NOT NULL,
    PRIMARY KEY (module_path, version, file_path),
    FOREIGN KEY (module_path, version)
        REFERENCES modules (module_path, version) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS fetch_status (
    module_path text NOT NULL,
    version text NOT NULL,
    code integer NOT NULL,
    error_kind text NOT NULL DEFAULT 'none',
    error_message text NOT NULL DEFAULT '',
    try_count integer NOT NULL DEFAULT 1,
    next_eligible_at timestamptz,
    last_attempted_at timestamptz NOT NULL,
    app_version_label text NOT NULL,
    PRIMARY KEY (module_path, version)
);

CREATE INDEX IF NOT EXISTS fetch_status_label_idx
    ON fetch_status (app_version_label, code);

CREATE TABLE IF NOT EXISTS latest_view (
    module_path text PRIMARY KEY,
    version text NOT NULL,
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS exclusions (
    prefix text PRIMARY KEY,
    reason text NOT NULL,
    author text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS index_cursor (
    source text PRIMARY KEY,
    last_seen_timestamp timestamptz,
    last_seen_key text
);
"#;

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct SearchResult {
    pub import_path: CompactString,
    pub version: CompactString,
    pub name: CompactString,
    pub synopsis: String,
}

/// Transactional persistence over Postgres.
///
/// Writes for one `module_path` serialize on an advisory lock, which
/// together with the queue's per-module gate makes LatestView
/// recomputation race-free at read-committed isolation.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Atomically replace every row for the record's identity, write its
    /// status, and recompute LatestView for the module in one transaction.
    ///
    /// Fails with `DbConflict` when another successful attempt for the
    /// same identity and an equal-or-newer label committed after
    /// `started_at`: the caller's work is stale, not wrong.
    #[tracing::instrument(skip(self, rec), fields(module = %rec.id))]
    pub async fn upsert_module(
        &self,
        rec: &ModuleRecord,
        code: FetchCode,
        app_label: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let size = record_size(rec);
        if size > MAX_RECORD_BYTES {
            return Err(FetchError::TooLarge(format!(
                "module record is {size} bytes (cap {MAX_RECORD_BYTES})"
            )));
        }

        let m = rec.id.module_path.as_str();
        let v = rec.id.version.as_str();

        let mut tx = self.pool.begin().await.map_err(FetchError::from)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(m)
            .execute(&mut *tx)
            .await
            .map_err(FetchError::from)?;

        let prior = sqlx::query(
            "SELECT code, app_version_label, last_attempted_at \
             FROM fetch_status WHERE module_path = $1 AND version = $2 FOR UPDATE",
        )
        .bind(m)
        .bind(v)
        .fetch_optional(&mut *tx)
        .await
        .map_err(FetchError::from)?;

        if let Some(row) = prior {
            let prior_code: i32 = row.get("code");
            let prior_label: String = row.get("app_version_label");
            let prior_at: DateTime<Utc> = row.get("last_attempted_at");
            let good = FetchCode::from_u16(prior_code as u16).is_some_and(|c| c.is_good());
            if good && prior_label.as_str() >= app_label && prior_at >= started_at {
                return Err(FetchError::DbConflict);
            }
        }

        sqlx::query("DELETE FROM modules WHERE module_path = $1 AND version = $2")
            .bind(m)
            .bind(v)
            .execute(&mut *tx)
            .await
            .map_err(FetchError::from)?;

        sqlx::query(
            "INSERT INTO modules \
             (module_path, version, commit_time, go_mod, has_go_mod, redistributable, \
              readme_path, readme_contents, source_info) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(m)
        .bind(v)
        .bind(rec.commit_time)
        .bind(rec.go_mod.as_slice())
        .bind(rec.has_go_mod)
        .bind(rec.redistributable)
        .bind(rec.readme.as_ref().map(|r| r.file_path.as_str()))
        .bind(rec.readme.as_ref().map(|r| r.contents.as_str()))
        .bind(rec.source_info.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .map_err(FetchError::from)?;

        for pkg in &rec.packages {
            sqlx::query(
                "INSERT INTO packages \
                 (module_path, version, import_path, name, synopsis, imports, \
                  exported_api, doc_source, goos, goarch) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(m)
            .bind(v)
            .bind(pkg.import_path.as_str())
            .bind(pkg.name.as_str())
            .bind(pkg.synopsis.as_str())
            .bind(Json(&pkg.imports))
            .bind(Json(&pkg.exported_api))
            .bind(pkg.doc_source.as_slice())
            .bind(pkg.goos.as_deref())
            .bind(pkg.goarch.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(FetchError::from)?;
        }

        for lic in &rec.licenses {
            sqlx::query(
                "INSERT INTO licenses \
                 (module_path, version, file_path, detected_type, coverage, redistributable) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(m)
            .bind(v)
            .bind(lic.file_path.as_str())
            .bind(lic.detected_type.as_str())
            .bind(lic.coverage as i16)
            .bind(lic.redistributable)
            .execute(&mut *tx)
            .await
            .map_err(FetchError::from)?;
        }

        sqlx::query(
            "INSERT INTO fetch_status \
             (module_path, version, code, error_kind, error_message, try_count, \
              next_eligible_at, last_attempted_at, app_version_label) \
             VALUES ($1, $2, $3, 'none', '', 1, NULL, now(), $4) \
             ON CONFLICT (module_path, version) DO UPDATE SET \
              code = EXCLUDED.code, error_kind = 'none', error_message = '', \
              try_count = fetch_status.try_count + 1, next_eligible_at = NULL, \
              last_attempted_at = now(), app_version_label = EXCLUDED.app_version_label",
        )
        .bind(m)
        .bind(v)
        .bind(code.as_u16() as i32)
        .bind(app_label)
        .execute(&mut *tx)
        .await
        .map_err(FetchError::from)?;

        recompute_latest(&mut tx, m).await.map_err(FetchError::from)?;

        tx.commit().await.map_err(FetchError::from)?;
        Ok(())
    }

    /// Upsert the status row only; content is untouched.
    #[tracing::instrument(skip(self, message))]
    pub async fn set_status(
        &self,
        id: &ModuleVersion,
        code: FetchCode,
        kind: ErrorKind,
        message: &str,
        app_label: &str,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO fetch_status \
             (module_path, version, code, error_kind, error_message, try_count, \
              next_eligible_at, last_attempted_at, app_version_label) \
             VALUES ($1, $2, $3, $4, $5, 1, $6, now(), $7) \
             ON CONFLICT (module_path, version) DO UPDATE SET \
              code = EXCLUDED.code, error_kind = EXCLUDED.error_kind, \
              error_message = EXCLUDED.error_message, \
              try_count = fetch_status.try_count + 1, \
              next_eligible_at = EXCLUDED.next_eligible_at, \
              last_attempted_at = now(), \
              app_version_label = EXCLUDED.app_version_label",
        )
        .bind(id.module_path.as_str())
        .bind(id.version.as_str())
        .bind(code.as_u16() as i32)
        .bind(kind.as_str())
        .bind(message)
        .bind(next_eligible_at)
        .bind(app_label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a good record exists under an equal-or-newer app label.
    pub async fn has_good_version(
        &self,
        id: &ModuleVersion,
        app_label: &str,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM fetch_status \
             WHERE module_path = $1 AND version = $2 \
               AND code IN (200, 290) AND app_version_label >= $3) AS present",
        )
        .bind(id.module_path.as_str())
        .bind(id.version.as_str())
        .bind(app_label)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>("present"))
    }

    pub async fn latest_good_version(
        &self,
        module_path: &str,
    ) -> Result<Option<CompactString>, sqlx::Error> {
        let row = sqlx::query("SELECT version FROM latest_view WHERE module_path = $1")
            .bind(module_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("version").into()))
    }

    /// Good records written under a label older than `before_label`, the
    /// selection that drives re-ingestion after a binary upgrade.
    pub async fn modules_to_reprocess(
        &self,
        before_label: &str,
        limit: i64,
    ) -> Result<Vec<ModuleVersion>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT module_path, version FROM fetch_status \
             WHERE app_version_label < $1 AND code IN (200, 290) \
             ORDER BY last_attempted_at ASC LIMIT $2",
        )
        .bind(before_label)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                ModuleVersion::new(r.get::<String, _>("module_path"), r.get::<String, _>("version"))
            })
            .collect())
    }

    pub async fn load_exclusions(&self) -> Result<Vec<ExclusionEntry>, sqlx::Error> {
        let rows =
            sqlx::query("SELECT prefix, reason, author, created_at FROM exclusions ORDER BY prefix")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|r| ExclusionEntry {
                prefix: r.get::<String, _>("prefix").into(),
                reason: r.get("reason"),
                author: r.get::<String, _>("author").into(),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Add an exclusion and cascade-delete matching content. Append-only:
    /// re-adding an existing prefix is a no-op.
    #[tracing::instrument(skip(self, reason))]
    pub async fn add_exclusion(
        &self,
        prefix: &str,
        reason: &str,
        author: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO exclusions (prefix, reason, author) VALUES ($1, $2, $3) \
             ON CONFLICT (prefix) DO NOTHING",
        )
        .bind(prefix)
        .bind(reason)
        .bind(author)
        .execute(&mut *tx)
        .await?;

        if let Some((m, v)) = prefix.rsplit_once('@') {
            // Exact module@version: drop that record and re-derive the
            // module's latest pointer.
            sqlx::query("DELETE FROM modules WHERE module_path = $1 AND version = $2")
                .bind(m)
                .bind(v)
                .execute(&mut *tx)
                .await?;
            recompute_latest(&mut tx, m).await?;
        } else {
            sqlx::query(
                "DELETE FROM modules WHERE module_path = $1 OR module_path LIKE $2",
            )
            .bind(prefix)
            .bind(format!("{}/%", like_escape(prefix)))
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "DELETE FROM latest_view WHERE module_path = $1 OR module_path LIKE $2",
            )
            .bind(prefix)
            .bind(format!("{}/%", like_escape(prefix)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_status(&self, id: &ModuleVersion) -> Result<Option<FetchStatus>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT code, error_kind, error_message, try_count, next_eligible_at, \
                    last_attempted_at, app_version_label \
             FROM fetch_status WHERE module_path = $1 AND version = $2",
        )
        .bind(id.module_path.as_str())
        .bind(id.version.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FetchStatus {
            id: id.clone(),
            code: r.get::<i32, _>("code") as u16,
            error_kind: r.get::<String, _>("error_kind").into(),
            error_message: r.get("error_message"),
            try_count: r.get("try_count"),
            next_eligible_at: r.get("next_eligible_at"),
            last_attempted_at: r.get("last_attempted_at"),
            app_version_label: r.get::<String, _>("app_version_label").into(),
        }))
    }

    pub async fn get_module(
        &self,
        id: &ModuleVersion,
    ) -> Result<Option<ModuleRecord>, sqlx::Error> {
        let m = id.module_path.as_str();
        let v = id.version.as_str();

        let Some(row) = sqlx::query(
            "SELECT commit_time, go_mod, has_go_mod, redistributable, \
                    readme_path, readme_contents, source_info \
             FROM modules WHERE module_path = $1 AND version = $2",
        )
        .bind(m)
        .bind(v)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let packages = sqlx::query(
            "SELECT import_path, name, synopsis, imports, exported_api, doc_source, goos, goarch \
             FROM packages WHERE module_path = $1 AND version = $2 ORDER BY import_path",
        )
        .bind(m)
        .bind(v)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| decode_package_row(id, r))
        .collect::<Result<Vec<_>, _>>()?;

        let licenses = sqlx::query(
            "SELECT file_path, detected_type, coverage, redistributable \
             FROM licenses WHERE module_path = $1 AND version = $2 ORDER BY file_path",
        )
        .bind(m)
        .bind(v)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| LicenseFinding {
            file_path: r.get::<String, _>("file_path").into(),
            detected_type: r.get::<String, _>("detected_type").into(),
            coverage: r.get::<i16, _>("coverage") as u8,
            redistributable: r.get("redistributable"),
        })
        .collect();

        let readme = match (
            row.get::<Option<String>, _>("readme_path"),
            row.get::<Option<String>, _>("readme_contents"),
        ) {
            (Some(path), Some(contents)) => Some(Readme {
                file_path: path.into(),
                contents,
            }),
            _ => None,
        };

        Ok(Some(ModuleRecord {
            id: id.clone(),
            commit_time: row.get("commit_time"),
            go_mod: row.get::<Vec<u8>, _>("go_mod"),
            has_go_mod: row.get("has_go_mod"),
            redistributable: row.get("redistributable"),
            packages,
            licenses,
            readme,
            source_info: row
                .get::<Option<Json<SourceInfo>>, _>("source_info")
                .map(|j| j.0),
        }))
    }

    pub async fn get_package(
        &self,
        import_path: &str,
        version: &str,
    ) -> Result<Option<Package>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT module_path, import_path, name, synopsis, imports, exported_api, \
                    doc_source, goos, goarch \
             FROM packages WHERE import_path = $1 AND version = $2",
        )
        .bind(import_path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let id = ModuleVersion::new(r.get::<String, _>("module_path"), version);
            decode_package_row(&id, &r)
        })
        .transpose()
    }

    /// Latest good record for a module, if any.
    pub async fn get_latest(
        &self,
        module_path: &str,
    ) -> Result<Option<ModuleRecord>, sqlx::Error> {
        match self.latest_good_version(module_path).await? {
            Some(v) => {
                self.get_module(&ModuleVersion::new(module_path, v.as_str()))
                    .await
            }
            None => Ok(None),
        }
    }

    /// Prefix search over package names and import paths at their latest
    /// versions. Scoring belongs to the read front end; this only feeds it
    /// indexable columns.
    pub async fn search_by_name(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<SearchResult>, sqlx::Error> {
        let pattern = format!("{}%", like_escape(prefix));
        let rows = sqlx::query(
            "SELECT p.import_path, p.version, p.name, p.synopsis \
             FROM packages p \
             JOIN latest_view l \
               ON l.module_path = p.module_path AND l.version = p.version \
             WHERE p.name LIKE $1 OR p.import_path LIKE $1 \
             ORDER BY p.import_path LIMIT $2",
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| SearchResult {
                import_path: r.get::<String, _>("import_path").into(),
                version: r.get::<String, _>("version").into(),
                name: r.get::<String, _>("name").into(),
                synopsis: r.get("synopsis"),
            })
            .collect())
    }

    pub async fn load_cursor(&self, source: &str) -> Result<IndexCursor, sqlx::Error> {
        let row = sqlx::query(
            "SELECT last_seen_timestamp, last_seen_key FROM index_cursor WHERE source = $1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| IndexCursor {
                last_seen_timestamp: r.get("last_seen_timestamp"),
                last_seen_key: r.get::<Option<String>, _>("last_seen_key").map(Into::into),
            })
            .unwrap_or_default())
    }

    pub async fn save_cursor(
        &self,
        source: &str,
        cursor: &IndexCursor,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO index_cursor (source, last_seen_timestamp, last_seen_key) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (source) DO UPDATE SET \
              last_seen_timestamp = EXCLUDED.last_seen_timestamp, \
              last_seen_key = EXCLUDED.last_seen_key",
        )
        .bind(source)
        .bind(cursor.last_seen_timestamp)
        .bind(cursor.last_seen_key.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn record_size(rec: &ModuleRecord) -> u64 {
    let mut size = rec.go_mod.len() as u64;
    if let Some(readme) = &rec.readme {
        size += readme.contents.len() as u64;
    }
    for pkg in &rec.packages {
        size += pkg.doc_source.len() as u64 + pkg.synopsis.len() as u64;
    }
    size
}

fn decode_package_row(id: &ModuleVersion, r: &PgRow) -> Result<Package, sqlx::Error> {
    Ok(Package {
        module_path: id.module_path.clone(),
        import_path: r.get::<String, _>("import_path").into(),
        name: r.get::<String, _>("name").into(),
        synopsis: r.get("synopsis"),
        imports: r.get::<Json<IndexSet<CompactString>>, _>("imports").0,
        exported_api: r.get::<Json<Vec<ApiSymbol>>, _>("exported_api").0,
        doc_source: r.get::<Vec<u8>, _>("doc_source"),
        goos: r.get::<Option<String>, _>("goos").map(Into::into),
        goarch: r.get::<Option<String>, _>("goarch").map(Into::into),
    })
}

/// Re-derive the LatestView row for one module inside the caller's
/// transaction: greatest good version not covered by an exclusion.
async fn recompute_latest(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    module_path: &str,
) -> Result<(), sqlx::Error> {
    let versions: Vec<String> = sqlx::query(
        "SELECT version FROM fetch_status \
         WHERE module_path = $1 AND code IN (200, 290)",
    )
    .bind(module_path)
    .fetch_all(&mut **tx)
    .await?
    .iter()
    .map(|r| r.get("version"))
    .collect();

    let exclusions: Vec<ExclusionEntry> = sqlx::query("SELECT prefix FROM exclusions")
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(|r| ExclusionEntry {
            prefix: r.get::<String, _>("prefix").into(),
            reason: String::new(),
            author: "".into(),
            created_at: Utc::now(),
        })
        .collect();
    let excluded = |v: &str| exclusions.iter().any(|e| e.covers(module_path, Some(v)));

    let latest = version::pick_latest(
        versions
            .iter()
            .map(|v| v.as_str())
            .filter(|v| !excluded(v)),
    );

    match latest {
        Some(v) => {
            sqlx::query(
                "INSERT INTO latest_view (module_path, version, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (module_path) DO UPDATE SET \
                  version = EXCLUDED.version, updated_at = now()",
            )
            .bind(module_path)
            .bind(v.as_str())
            .execute(&mut **tx)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM latest_view WHERE module_path = $1")
                .bind(module_path)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SymbolKind;
    use indexmap::IndexSet;

    fn sample_record(m: &str, v: &str) -> ModuleRecord {
        use chrono::TimeZone;
        ModuleRecord {
            id: ModuleVersion::new(m, v),
            // Whole-second precision survives the timestamptz round trip.
            commit_time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            go_mod: format!("module {m}\n").into_bytes(),
            has_go_mod: true,
            redistributable: true,
            packages: vec![Package {
                module_path: m.into(),
                import_path: m.into(),
                name: "a".into(),
                synopsis: "Pkg A.".into(),
                imports: IndexSet::from(["fmt".into()]),
                exported_api: vec![ApiSymbol {
                    name: "F".into(),
                    kind: SymbolKind::Func,
                    signature: "func F()".into(),
                    contexts: vec![],
                }],
                doc_source: b"MDX1rest".to_vec(),
                goos: None,
                goarch: None,
            }],
            licenses: vec![LicenseFinding {
                file_path: "LICENSE".into(),
                detected_type: "MIT".into(),
                coverage: 100,
                redistributable: true,
            }],
            readme: None,
            source_info: None,
        }
    }

    async fn test_store() -> Store {
        let dsn = std::env::var("MODINDEX_TEST_DATABASE_URL")
            .expect("set MODINDEX_TEST_DATABASE_URL to run store tests");
        let store = Store::connect(&dsn).await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[test]
    fn record_size_counts_blobs() {
        let rec = sample_record("example.com/a", "v1.0.0");
        assert!(record_size(&rec) > 0);
        assert!(record_size(&rec) < MAX_RECORD_BYTES);
    }

    #[test]
    fn like_escaping() {
        assert_eq!(like_escape("a_b%c"), "a\\_b\\%c");
    }

    #[tokio::test]
    #[ignore]
    async fn upsert_and_read_back() {
        let store = test_store().await;
        let rec = sample_record("store-test.example.com/a", "v1.0.0");
        store
            .upsert_module(&rec, FetchCode::Ok, "l1", Utc::now())
            .await
            .unwrap();

        let read = store.get_module(&rec.id).await.unwrap().unwrap();
        assert_eq!(read, rec);
        assert_eq!(
            store
                .latest_good_version("store-test.example.com/a")
                .await
                .unwrap()
                .as_deref(),
            Some("v1.0.0")
        );
        assert!(store.has_good_version(&rec.id, "l1").await.unwrap());
        assert!(store.has_good_version(&rec.id, "l0").await.unwrap());
        assert!(!store.has_good_version(&rec.id, "l2").await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn older_version_does_not_displace_latest() {
        let store = test_store().await;
        let newer = sample_record("store-test.example.com/b", "v1.1.0");
        let older = sample_record("store-test.example.com/b", "v1.0.0");
        store
            .upsert_module(&newer, FetchCode::Ok, "l1", Utc::now())
            .await
            .unwrap();
        store
            .upsert_module(&older, FetchCode::Ok, "l1", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store
                .latest_good_version("store-test.example.com/b")
                .await
                .unwrap()
                .as_deref(),
            Some("v1.1.0")
        );
    }

    #[tokio::test]
    #[ignore]
    async fn stale_attempt_conflicts() {
        let store = test_store().await;
        let rec = sample_record("store-test.example.com/c", "v1.0.0");
        store
            .upsert_module(&rec, FetchCode::Ok, "l1", Utc::now())
            .await
            .unwrap();

        // An attempt that started before the successful commit is stale.
        let stale_start = Utc::now() - chrono::Duration::hours(1);
        let err = store
            .upsert_module(&rec, FetchCode::Ok, "l1", stale_start)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::DbConflict));
    }

    #[tokio::test]
    #[ignore]
    async fn exclusion_cascades_content() {
        let store = test_store().await;
        let rec = sample_record("store-test.example.com/bad/x", "v1.0.0");
        store
            .upsert_module(&rec, FetchCode::Ok, "l1", Utc::now())
            .await
            .unwrap();

        store
            .add_exclusion("store-test.example.com/bad", "spam", "admin")
            .await
            .unwrap();

        assert!(store.get_module(&rec.id).await.unwrap().is_none());
        assert_eq!(
            store
                .latest_good_version("store-test.example.com/bad/x")
                .await
                .unwrap(),
            None
        );
    }
}
