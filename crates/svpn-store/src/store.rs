//! SQLite-backed persistence for groups, rules, and the resolver/pre-warm
//! caches. Grounded on `wirewarden-api/src/db/vpn.rs`'s `VpnStore`: a
//! cloneable struct wrapping a pool, one `#[tracing::instrument]`'d method
//! per operation, typed errors mapped from constraint violations.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Row, SqlitePool};
use tracing::instrument;

use svpn_types::model::{Port, Protocol, RawSelectorKind, RawSelectorLine, RoutingRule};
use svpn_types::resolver::{PrewarmRow, ResolverCacheRow, ResolverRunRecord, ResolverSelector, ResolverValues, SelectorKind};
use svpn_types::{canon, DomainGroup};

use crate::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn raw_kind_str(kind: RawSelectorKind) -> &'static str {
    match kind {
        RawSelectorKind::SourceInterface => "source_interface",
        RawSelectorKind::SourceMac => "source_mac",
        RawSelectorKind::SourceCidr => "source_cidr",
        RawSelectorKind::ExcludedSourceCidr => "excluded_source_cidr",
        RawSelectorKind::DestinationCidr => "destination_cidr",
        RawSelectorKind::ExcludedDestinationCidr => "excluded_destination_cidr",
        RawSelectorKind::DestinationPort => "destination_port",
        RawSelectorKind::ExcludedDestinationPort => "excluded_destination_port",
        RawSelectorKind::DestinationAsn => "destination_asn",
        RawSelectorKind::ExcludedDestinationAsn => "excluded_destination_asn",
        RawSelectorKind::ExactDomain => "exact_domain",
        RawSelectorKind::WildcardDomain => "wildcard_domain",
    }
}

fn raw_kind_from_str(s: &str) -> Option<RawSelectorKind> {
    Some(match s {
        "source_interface" => RawSelectorKind::SourceInterface,
        "source_mac" => RawSelectorKind::SourceMac,
        "source_cidr" => RawSelectorKind::SourceCidr,
        "excluded_source_cidr" => RawSelectorKind::ExcludedSourceCidr,
        "destination_cidr" => RawSelectorKind::DestinationCidr,
        "excluded_destination_cidr" => RawSelectorKind::ExcludedDestinationCidr,
        "destination_port" => RawSelectorKind::DestinationPort,
        "excluded_destination_port" => RawSelectorKind::ExcludedDestinationPort,
        "destination_asn" => RawSelectorKind::DestinationAsn,
        "excluded_destination_asn" => RawSelectorKind::ExcludedDestinationAsn,
        "exact_domain" => RawSelectorKind::ExactDomain,
        "wildcard_domain" => RawSelectorKind::WildcardDomain,
        _ => return None,
    })
}

fn selector_kind_str(kind: SelectorKind) -> &'static str {
    match kind {
        SelectorKind::Domain => "domain",
        SelectorKind::Asn => "asn",
        SelectorKind::Wildcard => "wildcard",
    }
}

fn selector_kind_from_str(s: &str) -> Option<SelectorKind> {
    Some(match s {
        "domain" => SelectorKind::Domain,
        "asn" => SelectorKind::Asn,
        "wildcard" => SelectorKind::Wildcard,
        _ => return None,
    })
}

/// SQLite-backed implementation of the persistence layer described in
/// spec.md §4.4.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Wrap an already-migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Store { pool }
    }

    /// Open (and migrate) a SQLite database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = crate::schema::open(path).await?;
        Ok(Store { pool })
    }

    /// The underlying pool, for callers that need raw `sqlx` access
    /// (e.g. an external stats-collection component writing
    /// `stats_history` rows this store only prunes).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- Group CRUD -----------------------------------------------------

    /// Create a group, validating its name and returning the hydrated row.
    #[instrument(skip(self))]
    pub async fn create_group(&self, name: &str, egress_vpn: &str) -> Result<DomainGroup> {
        let name = canon::normalize_group_name(name)?;
        let now = now_epoch();
        let result = sqlx::query(
            "INSERT INTO domain_groups (name, egress_vpn, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&name)
        .bind(egress_vpn)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateGroupName(name.clone())
            } else {
                StoreError::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        self.get_group(id).await?.ok_or(StoreError::GroupNotFound(id))
    }

    /// Update a group's name and egress VPN.
    #[instrument(skip(self))]
    pub async fn update_group(&self, id: i64, name: &str, egress_vpn: &str) -> Result<DomainGroup> {
        let name = canon::normalize_group_name(name)?;
        let now = now_epoch();
        let result = sqlx::query(
            "UPDATE domain_groups SET name = ?, egress_vpn = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&name)
        .bind(egress_vpn)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateGroupName(name.clone())
            } else {
                StoreError::Database(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound(id));
        }
        self.get_group(id).await?.ok_or(StoreError::GroupNotFound(id))
    }

    /// Delete a group; cascades all rule/selector/legacy-domain rows.
    #[instrument(skip(self))]
    pub async fn delete_group(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM domain_groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound(id));
        }
        Ok(())
    }

    /// Fetch one fully-hydrated group (rules, selectors, raw lines; legacy
    /// domain-only groups synthesize a single rule).
    #[instrument(skip(self))]
    pub async fn get_group(&self, id: i64) -> Result<Option<DomainGroup>> {
        let row = sqlx::query("SELECT id, name, egress_vpn, created_at, updated_at FROM domain_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(self.hydrate(row).await?))
    }

    /// List all groups, name ascending, fully hydrated.
    #[instrument(skip(self))]
    pub async fn list_groups(&self) -> Result<Vec<DomainGroup>> {
        let rows = sqlx::query("SELECT id, name, egress_vpn, created_at, updated_at FROM domain_groups ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            groups.push(self.hydrate(row).await?);
        }
        Ok(groups)
    }

    async fn hydrate(&self, row: sqlx::sqlite::SqliteRow) -> Result<DomainGroup> {
        let id: i64 = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let egress_vpn: String = row.try_get("egress_vpn")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        let rule_rows = sqlx::query("SELECT id, position, exclude_multicast FROM routing_rules WHERE group_id = ? ORDER BY position ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        let rules = if rule_rows.is_empty() {
            self.synthesize_legacy_rule(id).await?
        } else {
            let mut rules = Vec::with_capacity(rule_rows.len());
            for rr in rule_rows {
                let rule_id: i64 = rr.try_get("id")?;
                let position: i32 = rr.try_get("position")?;
                let exclude_multicast: Option<i64> = rr.try_get("exclude_multicast")?;
                rules.push(self.hydrate_rule(rule_id, position, exclude_multicast.map(|v| v != 0)).await?);
            }
            rules
        };

        Ok(DomainGroup { id, name, egress_vpn, created_at, updated_at, rules })
    }

    async fn synthesize_legacy_rule(&self, group_id: i64) -> Result<Vec<RoutingRule>> {
        let domains: Vec<(String,)> = sqlx::query_as("SELECT domain FROM domain_entries WHERE group_id = ? ORDER BY domain ASC")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        if domains.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![RoutingRule {
            id: 0,
            position: 0,
            exact_domains: domains.into_iter().map(|(d,)| d).collect(),
            ..Default::default()
        }])
    }

    async fn hydrate_rule(&self, rule_id: i64, position: i32, exclude_multicast: Option<bool>) -> Result<RoutingRule> {
        let source_interfaces: Vec<(String,)> = sqlx::query_as(
            "SELECT interface FROM routing_rule_source_interfaces WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let source_macs: Vec<(String,)> = sqlx::query_as(
            "SELECT mac FROM routing_rule_source_macs WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let source_cidrs: Vec<(String,)> = sqlx::query_as(
            "SELECT cidr FROM routing_rule_source_cidrs WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let excluded_source_cidrs: Vec<(String,)> = sqlx::query_as(
            "SELECT cidr FROM routing_rule_excluded_source_cidrs WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let destination_cidrs: Vec<(String,)> = sqlx::query_as(
            "SELECT cidr FROM routing_rule_destination_cidrs WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let excluded_destination_cidrs: Vec<(String,)> = sqlx::query_as(
            "SELECT cidr FROM routing_rule_excluded_destination_cidrs WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let destination_ports = self.hydrate_ports(rule_id, "routing_rule_ports").await?;
        let excluded_destination_ports = self.hydrate_ports(rule_id, "routing_rule_excluded_ports").await?;

        let destination_asns: Vec<(String,)> = sqlx::query_as(
            "SELECT asn FROM routing_rule_asns WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let excluded_destination_asns: Vec<(String,)> = sqlx::query_as(
            "SELECT asn FROM routing_rule_excluded_asns WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        let domain_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT domain, is_wildcard FROM routing_rule_domains WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;
        let mut exact_domains = Vec::new();
        let mut wildcard_domains = Vec::new();
        for (domain, is_wildcard) in domain_rows {
            if is_wildcard != 0 {
                wildcard_domains.push(domain);
            } else {
                exact_domains.push(domain);
            }
        }

        let raw_rows: Vec<(String, String, i32)> = sqlx::query_as(
            "SELECT selector, line, position FROM routing_rule_selector_lines WHERE rule_id = ? ORDER BY position ASC",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;
        let raw_selectors = if raw_rows.is_empty() {
            None
        } else {
            Some(
                raw_rows
                    .into_iter()
                    .filter_map(|(selector, line, position)| {
                        raw_kind_from_str(&selector).map(|kind| RawSelectorLine { kind, line, position })
                    })
                    .collect(),
            )
        };

        Ok(RoutingRule {
            id: rule_id,
            position,
            source_interfaces: source_interfaces.into_iter().map(|(v,)| v).collect(),
            source_macs: source_macs.into_iter().map(|(v,)| v).collect(),
            source_cidrs: source_cidrs.into_iter().map(|(v,)| v).collect(),
            excluded_source_cidrs: excluded_source_cidrs.into_iter().map(|(v,)| v).collect(),
            destination_cidrs: destination_cidrs.into_iter().map(|(v,)| v).collect(),
            excluded_destination_cidrs: excluded_destination_cidrs.into_iter().map(|(v,)| v).collect(),
            destination_ports,
            excluded_destination_ports,
            destination_asns: destination_asns.into_iter().map(|(v,)| v).collect(),
            excluded_destination_asns: excluded_destination_asns.into_iter().map(|(v,)| v).collect(),
            exact_domains,
            wildcard_domains,
            exclude_multicast: svpn_types::model::ExcludeMulticast(exclude_multicast),
            raw_selectors,
        })
    }

    async fn hydrate_ports(&self, rule_id: i64, table: &str) -> Result<Vec<Port>> {
        let sql = format!("SELECT protocol, start_port, end_port FROM {table} WHERE rule_id = ? ORDER BY position ASC");
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&sql).bind(rule_id).fetch_all(&self.pool).await?;
        let mut ports = Vec::with_capacity(rows.len());
        for (protocol, start, end) in rows {
            let protocol: Protocol = protocol.parse().map_err(StoreError::Validation)?;
            ports.push(Port { protocol, start: start as u16, end: end as u16 });
        }
        Ok(ports)
    }

    /// Delete-and-reinsert a group's entire rule list within one
    /// transaction (spec.md §4.4 `replaceRules`).
    #[instrument(skip(self, rules))]
    pub async fn replace_rules(&self, group_id: i64, rules: &[RoutingRule]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM routing_rules WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        for rule in rules {
            let result = sqlx::query(
                "INSERT INTO routing_rules (group_id, position, exclude_multicast) VALUES (?, ?, ?)",
            )
            .bind(group_id)
            .bind(rule.position)
            .bind(rule.exclude_multicast.0.map(|b| b as i64))
            .execute(&mut *tx)
            .await?;
            let rule_id = result.last_insert_rowid();

            for (i, v) in rule.source_interfaces.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_source_interfaces (rule_id, interface, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.source_macs.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_source_macs (rule_id, mac, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.source_cidrs.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_source_cidrs (rule_id, cidr, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.excluded_source_cidrs.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_excluded_source_cidrs (rule_id, cidr, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.destination_cidrs.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_destination_cidrs (rule_id, cidr, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.excluded_destination_cidrs.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_excluded_destination_cidrs (rule_id, cidr, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, p) in rule.destination_ports.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_ports (rule_id, protocol, start_port, end_port, position) VALUES (?, ?, ?, ?, ?)")
                    .bind(rule_id).bind(p.protocol.to_string()).bind(p.start as i64).bind(p.end as i64).bind(i as i32)
                    .execute(&mut *tx).await?;
            }
            for (i, p) in rule.excluded_destination_ports.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_excluded_ports (rule_id, protocol, start_port, end_port, position) VALUES (?, ?, ?, ?, ?)")
                    .bind(rule_id).bind(p.protocol.to_string()).bind(p.start as i64).bind(p.end as i64).bind(i as i32)
                    .execute(&mut *tx).await?;
            }
            for (i, v) in rule.destination_asns.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_asns (rule_id, asn, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            for (i, v) in rule.excluded_destination_asns.iter().enumerate() {
                sqlx::query("INSERT INTO routing_rule_excluded_asns (rule_id, asn, position) VALUES (?, ?, ?)")
                    .bind(rule_id).bind(v).bind(i as i32).execute(&mut *tx).await?;
            }
            let mut domain_position = 0i32;
            for v in &rule.exact_domains {
                sqlx::query("INSERT INTO routing_rule_domains (rule_id, domain, is_wildcard, position) VALUES (?, ?, 0, ?)")
                    .bind(rule_id).bind(v).bind(domain_position).execute(&mut *tx).await?;
                domain_position += 1;
            }
            for v in &rule.wildcard_domains {
                sqlx::query("INSERT INTO routing_rule_domains (rule_id, domain, is_wildcard, position) VALUES (?, ?, 1, ?)")
                    .bind(rule_id).bind(v).bind(domain_position).execute(&mut *tx).await?;
                domain_position += 1;
            }
            if let Some(raw_lines) = &rule.raw_selectors {
                for line in raw_lines {
                    sqlx::query("INSERT INTO routing_rule_selector_lines (rule_id, selector, line, position) VALUES (?, ?, ?, ?)")
                        .bind(rule_id).bind(raw_kind_str(line.kind)).bind(&line.line).bind(line.position)
                        .execute(&mut *tx).await?;
                }
            }
        }

        sqlx::query("UPDATE domain_groups SET updated_at = ? WHERE id = ?")
            .bind(now_epoch())
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // -- Resolver cache ---------------------------------------------------

    /// Additive snapshot merge: inserts/refreshes rows, never deletes.
    #[instrument(skip(self, rows))]
    pub async fn upsert_resolver_snapshot(&self, rows: &[ResolverCacheRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            self.upsert_resolver_row(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_resolver_row(&self, tx: &mut sqlx::SqliteConnection, row: &ResolverCacheRow) -> Result<()> {
        for cidr in &row.values.v4 {
            sqlx::query(
                "INSERT INTO resolver_cache (selector_type, selector_key, family, cidr, updated_at)
                 VALUES (?, ?, 'inet', ?, ?)
                 ON CONFLICT (selector_type, selector_key, family, cidr)
                 DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(selector_kind_str(row.selector.kind))
            .bind(&row.selector.key)
            .bind(cidr)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for cidr in &row.values.v6 {
            sqlx::query(
                "INSERT INTO resolver_cache (selector_type, selector_key, family, cidr, updated_at)
                 VALUES (?, ?, 'inet6', ?, ?)
                 ON CONFLICT (selector_type, selector_key, family, cidr)
                 DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(selector_kind_str(row.selector.kind))
            .bind(&row.selector.key)
            .bind(cidr)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        Ok(())
    }

    /// Full-sweep replacement: delete every row, then insert `rows`.
    #[instrument(skip(self, rows))]
    pub async fn replace_resolver_snapshot(&self, rows: &[ResolverCacheRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM resolver_cache").execute(&mut *tx).await?;
        for row in rows {
            self.upsert_resolver_row(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load all non-expired resolver cache rows, grouped by selector.
    #[instrument(skip(self))]
    pub async fn load_resolver_snapshot(&self, retention_days: i64) -> Result<Vec<ResolverCacheRow>> {
        let cutoff = now_epoch() - retention_days * 86_400;
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT selector_type, selector_key, family, cidr, updated_at FROM resolver_cache WHERE updated_at >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<(SelectorKind, String), (ResolverValues, i64)> = BTreeMap::new();
        for (selector_type, selector_key, family, cidr, updated_at) in rows {
            let Some(kind) = selector_kind_from_str(&selector_type) else { continue };
            let entry = grouped.entry((kind, selector_key)).or_insert_with(|| (ResolverValues::default(), updated_at));
            if family == "inet" {
                entry.0.v4.push(cidr);
            } else {
                entry.0.v6.push(cidr);
            }
            entry.1 = entry.1.max(updated_at);
        }

        Ok(grouped
            .into_iter()
            .map(|((kind, key), (values, updated_at))| ResolverCacheRow {
                selector: ResolverSelector::new(kind, key),
                values,
                updated_at,
            })
            .collect())
    }

    /// Delete every resolver cache row.
    #[instrument(skip(self))]
    pub async fn clear_resolver_cache(&self) -> Result<()> {
        sqlx::query("DELETE FROM resolver_cache").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete resolver cache rows older than `retention_days`, returning
    /// the number removed.
    #[instrument(skip(self))]
    pub async fn purge_expired_resolver_cache(&self, retention_days: i64) -> Result<u64> {
        let cutoff = now_epoch() - retention_days * 86_400;
        let result = sqlx::query("DELETE FROM resolver_cache WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Pre-warm cache (analogous to resolver cache) ---------------------

    /// Additive pre-warm merge, keyed by `(set_name, family, cidr)`.
    #[instrument(skip(self, rows))]
    pub async fn upsert_prewarm_snapshot(&self, rows: &[PrewarmRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            self.upsert_prewarm_row(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_prewarm_row(&self, tx: &mut sqlx::SqliteConnection, row: &PrewarmRow) -> Result<()> {
        for cidr in &row.values.v4 {
            sqlx::query(
                "INSERT INTO prewarm_cache (set_name, family, cidr, updated_at) VALUES (?, 'inet', ?, ?)
                 ON CONFLICT (set_name, family, cidr) DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(&row.set_name).bind(cidr).bind(row.updated_at)
            .execute(&mut *tx).await?;
        }
        for cidr in &row.values.v6 {
            sqlx::query(
                "INSERT INTO prewarm_cache (set_name, family, cidr, updated_at) VALUES (?, 'inet6', ?, ?)
                 ON CONFLICT (set_name, family, cidr) DO UPDATE SET updated_at = excluded.updated_at",
            )
            .bind(&row.set_name).bind(cidr).bind(row.updated_at)
            .execute(&mut *tx).await?;
        }
        Ok(())
    }

    /// Full-sweep pre-warm cache replacement.
    #[instrument(skip(self, rows))]
    pub async fn replace_prewarm_snapshot(&self, rows: &[PrewarmRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM prewarm_cache").execute(&mut *tx).await?;
        for row in rows {
            self.upsert_prewarm_row(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load all non-expired pre-warm rows, grouped by set name.
    #[instrument(skip(self))]
    pub async fn load_prewarm_snapshot(&self, retention_days: i64) -> Result<Vec<PrewarmRow>> {
        let cutoff = now_epoch() - retention_days * 86_400;
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT set_name, family, cidr, updated_at FROM prewarm_cache WHERE updated_at >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<String, (ResolverValues, i64)> = BTreeMap::new();
        for (set_name, family, cidr, updated_at) in rows {
            let entry = grouped.entry(set_name).or_insert_with(|| (ResolverValues::default(), updated_at));
            if family == "inet" {
                entry.0.v4.push(cidr);
            } else {
                entry.0.v6.push(cidr);
            }
            entry.1 = entry.1.max(updated_at);
        }

        Ok(grouped
            .into_iter()
            .map(|(set_name, (values, updated_at))| PrewarmRow { set_name, values, updated_at })
            .collect())
    }

    /// Delete every pre-warm cache row.
    #[instrument(skip(self))]
    pub async fn clear_prewarm_cache(&self) -> Result<()> {
        sqlx::query("DELETE FROM prewarm_cache").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete pre-warm rows older than `retention_days`.
    #[instrument(skip(self))]
    pub async fn purge_expired_prewarm_cache(&self, retention_days: i64) -> Result<u64> {
        let cutoff = now_epoch() - retention_days * 86_400;
        let result = sqlx::query("DELETE FROM prewarm_cache WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Resolver run log ---------------------------------------------------

    /// Persist a resolver run record, returning its assigned id.
    #[instrument(skip(self, record))]
    pub async fn save_resolver_run(&self, record: &ResolverRunRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO resolver_runs (started_at, finished_at, duration_ms, selectors_total, selectors_done, prefixes_resolved, error)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms)
        .bind(record.selectors_total)
        .bind(record.selectors_done)
        .bind(record.prefixes_resolved)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fetch the most recently started resolver run, if any.
    #[instrument(skip(self))]
    pub async fn last_resolver_run(&self) -> Result<Option<ResolverRunRecord>> {
        let row: Option<(i64, i64, Option<i64>, Option<i64>, i32, i32, i32, Option<String>)> = sqlx::query_as(
            "SELECT id, started_at, finished_at, duration_ms, selectors_total, selectors_done, prefixes_resolved, error
             FROM resolver_runs ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, started_at, finished_at, duration_ms, selectors_total, selectors_done, prefixes_resolved, error)| {
            ResolverRunRecord { id, started_at, finished_at, duration_ms, selectors_total, selectors_done, prefixes_resolved, error }
        }))
    }

    // -- Background cleanup ------------------------------------------------

    /// Prune `stats_history` rows older than `retention_days`.
    #[instrument(skip(self))]
    pub async fn prune_stats_history(&self, retention_days: i64) -> Result<u64> {
        let cutoff = now_epoch() - retention_days * 86_400;
        let result = sqlx::query("DELETE FROM stats_history WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svpn_types::model::ExcludeMulticast;

    async fn test_store() -> Store {
        Store::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_group_round_trips() {
        let store = test_store().await;
        let group = store.create_group("Streaming", "wg-sgp").await.unwrap();
        assert_eq!(group.name, "Streaming");
        assert_eq!(group.egress_vpn, "wg-sgp");
        assert!(group.rules.is_empty());

        let fetched = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, group.id);
    }

    #[tokio::test]
    async fn duplicate_group_name_is_rejected() {
        let store = test_store().await;
        store.create_group("media", "wg-sgp").await.unwrap();
        let err = store.create_group("media", "wg-sgp").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateGroupName(_)));
    }

    #[tokio::test]
    async fn replace_rules_persists_full_selector_set() {
        let store = test_store().await;
        let group = store.create_group("media", "wg-sgp").await.unwrap();

        let rule = RoutingRule {
            position: 0,
            source_interfaces: vec!["eth0".into()],
            destination_cidrs: vec!["10.0.0.0/24".into()],
            destination_ports: vec![Port::new(Protocol::Tcp, 443, 443).unwrap()],
            exact_domains: vec!["example.com".into()],
            wildcard_domains: vec!["cdn.example.com".into()],
            exclude_multicast: ExcludeMulticast(Some(false)),
            ..Default::default()
        };
        store.replace_rules(group.id, &[rule]).await.unwrap();

        let fetched = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(fetched.rules.len(), 1);
        let rule = &fetched.rules[0];
        assert_eq!(rule.source_interfaces, vec!["eth0"]);
        assert_eq!(rule.destination_cidrs, vec!["10.0.0.0/24"]);
        assert_eq!(rule.destination_ports, vec![Port::new(Protocol::Tcp, 443, 443).unwrap()]);
        assert_eq!(rule.exact_domains, vec!["example.com"]);
        assert_eq!(rule.wildcard_domains, vec!["cdn.example.com"]);
        assert!(!rule.exclude_multicast.effective());
    }

    #[tokio::test]
    async fn replace_rules_is_delete_then_reinsert() {
        let store = test_store().await;
        let group = store.create_group("media", "wg-sgp").await.unwrap();

        store
            .replace_rules(group.id, &[RoutingRule { exact_domains: vec!["a.com".into()], ..Default::default() }])
            .await
            .unwrap();
        store
            .replace_rules(group.id, &[RoutingRule { exact_domains: vec!["b.com".into()], ..Default::default() }])
            .await
            .unwrap();

        let fetched = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(fetched.rules.len(), 1);
        assert_eq!(fetched.rules[0].exact_domains, vec!["b.com"]);
    }

    #[tokio::test]
    async fn legacy_domain_entries_synthesize_single_rule() {
        let store = test_store().await;
        let group = store.create_group("legacy", "wg-sgp").await.unwrap();
        sqlx::query("INSERT INTO domain_entries (group_id, domain) VALUES (?, 'a.com'), (?, 'b.com')")
            .bind(group.id)
            .bind(group.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let fetched = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(fetched.rules.len(), 1);
        assert_eq!(fetched.rules[0].exact_domains, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn deleting_group_cascades_rules() {
        let store = test_store().await;
        let group = store.create_group("media", "wg-sgp").await.unwrap();
        store
            .replace_rules(group.id, &[RoutingRule { exact_domains: vec!["a.com".into()], ..Default::default() }])
            .await
            .unwrap();
        store.delete_group(group.id).await.unwrap();
        assert!(store.get_group(group.id).await.unwrap().is_none());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM routing_rules")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn resolver_snapshot_upsert_is_additive() {
        let store = test_store().await;
        let selector = ResolverSelector::new(SelectorKind::Domain, "example.com".into());
        let row_a = ResolverCacheRow {
            selector: selector.clone(),
            values: ResolverValues { v4: vec!["1.1.1.1/32".into()], v6: vec![] },
            updated_at: 100,
        };
        store.upsert_resolver_snapshot(&[row_a]).await.unwrap();

        let row_b = ResolverCacheRow {
            selector: selector.clone(),
            values: ResolverValues { v4: vec!["2.2.2.2/32".into()], v6: vec![] },
            updated_at: 200,
        };
        store.upsert_resolver_snapshot(&[row_b]).await.unwrap();

        let loaded = store.load_resolver_snapshot(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].values.v4.len(), 2);
    }

    #[tokio::test]
    async fn resolver_snapshot_replace_clears_stale_entries() {
        let store = test_store().await;
        let selector = ResolverSelector::new(SelectorKind::Domain, "example.com".into());
        store
            .upsert_resolver_snapshot(&[ResolverCacheRow {
                selector: selector.clone(),
                values: ResolverValues { v4: vec!["1.1.1.1/32".into()], v6: vec![] },
                updated_at: 100,
            }])
            .await
            .unwrap();

        store
            .replace_resolver_snapshot(&[ResolverCacheRow {
                selector: selector.clone(),
                values: ResolverValues { v4: vec!["2.2.2.2/32".into()], v6: vec![] },
                updated_at: 200,
            }])
            .await
            .unwrap();

        let loaded = store.load_resolver_snapshot(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].values.v4, vec!["2.2.2.2/32"]);
    }

    #[tokio::test]
    async fn purge_expired_resolver_cache_removes_stale_rows_only() {
        let store = test_store().await;
        let old = ResolverSelector::new(SelectorKind::Domain, "old.com".into());
        let fresh = ResolverSelector::new(SelectorKind::Domain, "fresh.com".into());
        let now = now_epoch();
        store
            .upsert_resolver_snapshot(&[
                ResolverCacheRow { selector: old, values: ResolverValues { v4: vec!["1.1.1.1/32".into()], v6: vec![] }, updated_at: now - 8 * 86_400 },
                ResolverCacheRow { selector: fresh, values: ResolverValues { v4: vec!["2.2.2.2/32".into()], v6: vec![] }, updated_at: now },
            ])
            .await
            .unwrap();

        let purged = store.purge_expired_resolver_cache(7).await.unwrap();
        assert_eq!(purged, 1);
        let loaded = store.load_resolver_snapshot(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].selector.key, "fresh.com");
    }

    #[tokio::test]
    async fn resolver_run_log_tracks_most_recent() {
        let store = test_store().await;
        assert!(store.last_resolver_run().await.unwrap().is_none());

        store
            .save_resolver_run(&ResolverRunRecord {
                id: 0,
                started_at: 100,
                finished_at: Some(110),
                duration_ms: Some(10_000),
                selectors_total: 3,
                selectors_done: 3,
                prefixes_resolved: 12,
                error: None,
            })
            .await
            .unwrap();
        store
            .save_resolver_run(&ResolverRunRecord {
                id: 0,
                started_at: 200,
                finished_at: Some(205),
                duration_ms: Some(5_000),
                selectors_total: 1,
                selectors_done: 1,
                prefixes_resolved: 4,
                error: None,
            })
            .await
            .unwrap();

        let last = store.last_resolver_run().await.unwrap().unwrap();
        assert_eq!(last.started_at, 200);
    }
}
