//! Redundancy identifier (VRID) allocation.
//!
//! Each controller deployment (tenant) needs a pair of keepalived virtual
//! router identifiers, one per VIP group. The identifier space is shared by
//! every tenant on the appliance, so the appliance-side ledger is the source
//! of truth; a local ledger mirrors this tenant's entry.
//!
//! Ledger format, one entry per line:
//!
//! ```text
//! prod-east: 1,2
//! prod-west: 3,4
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use vlb_id::TenantKey;

use crate::appliance::Appliance;
use crate::store::{RecordStore, VRID_LEDGER_KEY};

/// Lowest usable identifier.
pub const VRID_MIN: u8 = 1;

/// Highest usable identifier.
pub const VRID_MAX: u8 = 255;

/// VRID allocation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VridError {
    /// Every identifier pair is taken.
    #[error("no free VRID pair left for tenant {tenant}")]
    NoIdentifiers { tenant: String },

    /// The appliance ledger could not be read or written.
    #[error("appliance VRID ledger unavailable: {0}")]
    External(String),

    /// The local ledger could not be read or written.
    #[error("failed to persist VRID ledger: {0}")]
    Persist(String),
}

impl VridError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NoIdentifiers { .. })
    }
}

/// Two consecutive identifiers `(i, i + 1)` with `i` odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VridPair(pub u8, pub u8);

impl VridPair {
    pub fn first(&self) -> u8 {
        self.0
    }

    pub fn second(&self) -> u8 {
        self.1
    }

    /// Whether the two pairs share an identifier.
    pub fn overlaps(&self, other: &VridPair) -> bool {
        self.0 == other.0 || self.0 == other.1 || self.1 == other.0 || self.1 == other.1
    }

    fn parse(s: &str) -> Option<Self> {
        let (a, b) = s.split_once(',')?;
        let a: u8 = a.trim().parse().ok()?;
        let b: u8 = b.trim().parse().ok()?;
        if a < VRID_MIN || b < VRID_MIN || a == b {
            return None;
        }
        Some(Self(a, b))
    }
}

impl std::fmt::Display for VridPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.0, self.1)
    }
}

/// Parse a ledger. Blank lines and `#` comments are skipped; malformed lines
/// are logged and skipped.
pub fn parse_ledger(text: &str) -> BTreeMap<TenantKey, VridPair> {
    let mut ledger = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = line.split_once(':').and_then(|(tenant, pair)| {
            let tenant = TenantKey::parse(tenant.trim()).ok()?;
            Some((tenant, VridPair::parse(pair)?))
        });

        match parsed {
            Some((tenant, pair)) => {
                ledger.insert(tenant, pair);
            }
            None => warn!(line = idx + 1, content = %line, "skipping malformed VRID ledger line"),
        }
    }

    ledger
}

/// Render a ledger, one `tenant: id1,id2` line per entry in key order.
pub fn format_ledger(ledger: &BTreeMap<TenantKey, VridPair>) -> String {
    let mut out = String::new();
    for (tenant, pair) in ledger {
        out.push_str(&format!("{tenant}: {pair}\n"));
    }
    out
}

/// First `(i, i + 1)` pair, `i` odd, that overlaps none of `used`.
pub fn find_free_pair<'a, I>(used: I) -> Option<VridPair>
where
    I: IntoIterator<Item = &'a VridPair>,
{
    let used: BTreeSet<u32> = used
        .into_iter()
        .flat_map(|pair| [u32::from(pair.0), u32::from(pair.1)])
        .collect();
    first_unused_pair(&used)
}

/// The appliance-side ledger, shared with every other deployment on the
/// appliance.
///
/// Other deployments' lines are kept verbatim, whatever their key looks like,
/// and every number they list counts as taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteLedger {
    lines: Vec<String>,
}

impl RemoteLedger {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    fn entry(line: &str) -> Option<(&str, &str)> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        line.split_once(':').map(|(key, value)| (key.trim(), value.trim()))
    }

    fn entries(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.lines.iter().filter_map(|line| Self::entry(line))
    }

    /// Whether the ledger has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Number of entries, this tenant's included.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Well-formed pair recorded for `tenant`.
    pub fn pair_of(&self, tenant: &TenantKey) -> Option<VridPair> {
        self.entries()
            .find(|(key, _)| *key == tenant.as_str())
            .and_then(|(_, value)| VridPair::parse(value))
    }

    /// Every identifier listed by entries other than `tenant`'s, in any
    /// shape.
    pub fn used_ids(&self, tenant: &TenantKey) -> BTreeSet<u32> {
        self.entries()
            .filter(|(key, _)| *key != tenant.as_str())
            .flat_map(|(_, value)| value.split(','))
            .filter_map(|id| id.trim().parse::<u32>().ok())
            .collect()
    }

    /// Record `pair` for `tenant`, replacing its line in place or appending
    /// one. Every other line is left as is.
    pub fn set(&mut self, tenant: &TenantKey, pair: VridPair) {
        let line = format!("{tenant}: {pair}");
        let existing = self
            .lines
            .iter_mut()
            .find(|l| Self::entry(l).is_some_and(|(key, _)| key == tenant.as_str()));
        match existing {
            Some(slot) => *slot = line,
            None => self.lines.push(line),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// First `(i, i + 1)` pair, `i` odd, with neither identifier in `used`.
pub fn first_unused_pair(used: &BTreeSet<u32>) -> Option<VridPair> {
    (VRID_MIN..VRID_MAX)
        .step_by(2)
        .map(|i| VridPair(i, i + 1))
        .find(|c| !used.contains(&u32::from(c.0)) && !used.contains(&u32::from(c.1)))
}

/// Allocates and remembers VRID pairs.
pub struct VridAllocator {
    records: Arc<dyn RecordStore>,
    appliance: Arc<dyn Appliance>,
    remote_path: String,
    tenant: TenantKey,
    ledger: Mutex<BTreeMap<TenantKey, VridPair>>,
}

impl VridAllocator {
    /// Load the local ledger. No appliance access happens here.
    pub async fn load(
        records: Arc<dyn RecordStore>,
        appliance: Arc<dyn Appliance>,
        tenant: TenantKey,
        remote_path: impl Into<String>,
    ) -> Result<Self, VridError> {
        let stored = records
            .get(VRID_LEDGER_KEY)
            .await
            .map_err(|e| VridError::Persist(format!("{e:#}")))?;

        let ledger = match stored {
            Some(bytes) => parse_ledger(&String::from_utf8_lossy(&bytes)),
            None => BTreeMap::new(),
        };

        Ok(Self {
            records,
            appliance,
            remote_path: remote_path.into(),
            tenant,
            ledger: Mutex::new(ledger),
        })
    }

    /// Tenant this controller runs as.
    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    /// Reconcile this tenant's pair against the appliance ledger. Runs once at
    /// start-up, before any service is reconciled.
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    pub async fn bootstrap(&self) -> Result<VridPair, VridError> {
        let mut ledger = self.ledger.lock().await;
        let tenant = self.tenant.clone();
        self.claim_remote(&mut ledger, &tenant).await
    }

    /// Pair for `tenant`, from the local ledger when known, otherwise
    /// allocated against the appliance ledger.
    pub async fn get_or_allocate(&self, tenant: &TenantKey) -> Result<VridPair, VridError> {
        let mut ledger = self.ledger.lock().await;
        if let Some(pair) = ledger.get(tenant) {
            return Ok(*pair);
        }
        self.claim_remote(&mut ledger, tenant).await
    }

    /// Copy of the local ledger.
    pub async fn local_ledger(&self) -> BTreeMap<TenantKey, VridPair> {
        self.ledger.lock().await.clone()
    }

    async fn claim_remote(
        &self,
        ledger: &mut BTreeMap<TenantKey, VridPair>,
        tenant: &TenantKey,
    ) -> Result<VridPair, VridError> {
        let text = self
            .appliance
            .fetch_file(&self.remote_path)
            .await
            .map_err(|e| VridError::External(format!("{e:#}")))?;
        let mut remote = RemoteLedger::parse(&text);

        let pair = match remote.pair_of(tenant) {
            Some(pair) => {
                if let Some(local) = ledger.get(tenant).filter(|local| **local != pair) {
                    warn!(%tenant, local = %local, remote = %pair, "local VRID pair differs from appliance; adopting appliance");
                }
                info!(%tenant, vrids = %pair, "adopted VRID pair from appliance");
                pair
            }
            None => {
                let mut used = remote.used_ids(tenant);

                // Reuse a locally remembered pair if nobody else took it.
                let remembered = ledger
                    .get(tenant)
                    .filter(|local| !used.contains(&u32::from(local.0)) && !used.contains(&u32::from(local.1)))
                    .copied();

                let pair = match remembered {
                    Some(pair) => pair,
                    None => {
                        for (_, pair) in ledger.iter().filter(|(key, _)| *key != tenant) {
                            used.extend([u32::from(pair.0), u32::from(pair.1)]);
                        }
                        first_unused_pair(&used).ok_or_else(|| VridError::NoIdentifiers {
                            tenant: tenant.to_string(),
                        })?
                    }
                };

                let seeded = remote.is_empty();
                remote.set(tenant, pair);
                self.appliance
                    .push_file(&self.remote_path, &remote.render())
                    .await
                    .map_err(|e| VridError::External(format!("{e:#}")))?;

                info!(%tenant, vrids = %pair, seeded, entries = remote.len(), "claimed VRID pair on appliance");
                pair
            }
        };

        let mut updated = ledger.clone();
        updated.insert(tenant.clone(), pair);
        self.records
            .put(VRID_LEDGER_KEY, format_ledger(&updated).as_bytes())
            .await
            .map_err(|e| VridError::Persist(format!("{e:#}")))?;
        *ledger = updated;

        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantKey {
        TenantKey::parse(s).unwrap()
    }

    #[test]
    fn test_parse_ledger_skips_noise() {
        let text = "# managed\n\nprod: 1,2\nbroken line\nstaging: 3, 4\nbad: 7\nzero: 0,1\n";
        let ledger = parse_ledger(text);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[&tenant("prod")], VridPair(1, 2));
        assert_eq!(ledger[&tenant("staging")], VridPair(3, 4));
    }

    #[test]
    fn test_format_ledger_sorted() {
        let ledger = BTreeMap::from([
            (tenant("west"), VridPair(3, 4)),
            (tenant("east"), VridPair(1, 2)),
        ]);
        assert_eq!(format_ledger(&ledger), "east: 1,2\nwest: 3,4\n");
        assert_eq!(parse_ledger(&format_ledger(&ledger)), ledger);
    }

    #[test]
    fn test_find_free_pair_skips_used_and_overlaps() {
        let none: [VridPair; 0] = [];
        assert_eq!(find_free_pair(&none), Some(VridPair(1, 2)));
        assert_eq!(find_free_pair([&VridPair(1, 2)]), Some(VridPair(3, 4)));
        // A foreign pair straddling two slots blocks both.
        assert_eq!(find_free_pair([&VridPair(2, 3)]), Some(VridPair(5, 6)));
    }

    #[test]
    fn test_find_free_pair_exhaustion() {
        let used: Vec<VridPair> = (1u8..=253).step_by(2).map(|i| VridPair(i, i + 1)).collect();
        assert_eq!(used.len(), 127);
        assert_eq!(find_free_pair(&used), None);

        let all_but_last = &used[..126];
        assert_eq!(find_free_pair(all_but_last), Some(VridPair(253, 254)));
    }

    #[test]
    fn test_remote_ledger_counts_every_foreign_identifier() {
        let remote = RemoteLedger::parse("# shared\nCluster_A: 1,2\nlegacy: 3,300\nbroken line\nprod: 9,10\n");

        assert_eq!(remote.pair_of(&tenant("prod")), Some(VridPair(9, 10)));
        assert_eq!(
            remote.used_ids(&tenant("prod")),
            BTreeSet::from([1, 2, 3, 300])
        );
        assert_eq!(first_unused_pair(&remote.used_ids(&tenant("prod"))), Some(VridPair(5, 6)));
    }

    #[test]
    fn test_remote_ledger_set_keeps_foreign_lines() {
        let mut remote = RemoteLedger::parse("Cluster_A: 1,2\nprod: garbage\n# note\n");
        assert_eq!(remote.pair_of(&tenant("prod")), None);

        remote.set(&tenant("prod"), VridPair(3, 4));
        remote.set(&tenant("staging"), VridPair(5, 6));

        assert_eq!(
            remote.render(),
            "Cluster_A: 1,2\nprod: 3,4\n# note\nstaging: 5,6\n"
        );
        assert_eq!(remote.len(), 3);
    }

    #[test]
    fn test_remote_ledger_empty() {
        assert!(RemoteLedger::parse("").is_empty());
        assert!(RemoteLedger::parse("# nothing yet\n\n").is_empty());
        assert_eq!(RemoteLedger::parse("").render(), "");
    }
}
