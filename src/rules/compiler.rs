use base64ct::Encoding;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::errors::SyncError;
use crate::rules::plan::SchemaPlan;
use crate::rules::types::*;

/// Compile configured rules against the schema plan. The built-in owner
/// rule is appended last.
pub fn compile_rules(configs: &[RuleConfig], plan: &SchemaPlan) -> Result<Vec<Rule>, SyncError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(configs.len() + 1);

    for cfg in configs {
        let name = cfg.name();
        if name == OWNER_RULE_NAME {
            return Err(invalid(name, "the name `owner` is reserved for the built-in owner rule"));
        }
        if !seen.insert(name.to_string()) {
            return Err(invalid(name, "duplicate rule name"));
        }
        let rule = match cfg {
            RuleConfig::Column(c) => compile_column_rule(c, None, plan)?,
            RuleConfig::GroupPropagation(c) => compile_group_propagation_rule(c)?,
        };
        rules.push(rule);
    }

    rules.push(owner_rule(plan));

    tracing::debug!(rules = rules.len(), "Compiled permission rules");
    Ok(rules)
}

/// Compile a column rule. A `custom` namer replaces the declarative
/// `group_name` and is left out of the hash.
pub fn compile_column_rule(
    cfg: &ColumnRuleConfig,
    custom: Option<GroupNamer>,
    plan: &SchemaPlan,
) -> Result<Rule, SyncError> {
    let name = cfg.name.as_str();
    check_name(name)?;
    if cfg.target_permissions.is_empty() {
        return Err(invalid(name, "`target_permissions` must not be empty"));
    }
    if cfg.targets.values().all(|types| types.is_empty()) {
        return Err(invalid(name, "`targets` must name at least one type"));
    }
    if cfg.assign_group && cfg.member_column.is_none() {
        return Err(invalid(name, "`assign_group` requires `member_column`"));
    }

    let mut targets: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut dispatch = BTreeMap::new();
    for (group, types) in &cfg.targets {
        for resource_type in types {
            let schema = plan.resource(group, resource_type).ok_or_else(|| {
                invalid(name, &format!("unknown target type `{group}.{resource_type}`"))
            })?;
            targets
                .entry(group.clone())
                .or_default()
                .insert(resource_type.clone(), schema.table.clone());
            for (table, entry) in plan.dispatch_for(group, resource_type).unwrap_or_default() {
                dispatch.insert(table, entry);
            }
        }
    }

    if let Some(indirect) = &cfg.target_type {
        if plan.resource(&indirect.group, &indirect.resource_type).is_none() {
            return Err(invalid(
                name,
                &format!(
                    "unknown indirect target type `{}.{}`",
                    indirect.group, indirect.resource_type
                ),
            ));
        }
    }

    let (group_name, declarative) = match custom {
        Some(namer) => (namer, None),
        None => {
            let declared = cfg
                .group_name
                .clone()
                .ok_or_else(|| invalid(name, "`group_name` is required"))?;
            (GroupNamer::Declarative(declared.clone()), Some(declared))
        }
    };

    let target_permissions = normalized(&cfg.target_permissions);
    let hash = content_hash(&HashInput {
        kind: "column",
        source_groups: Vec::new(),
        target_groups: Vec::new(),
        target_permissions: target_permissions.clone(),
        targets: targets.clone(),
        assign_group: cfg.assign_group,
        member_column: cfg.member_column.clone(),
        target_type: cfg.target_type.clone(),
        group_name: declarative,
    })?;

    Ok(Rule {
        name: cfg.name.clone(),
        hash,
        kind: RuleKind::Column(ColumnRule {
            targets,
            dispatch,
            group_name,
            target_permissions,
            assign_group: cfg.assign_group,
            member_column: cfg.member_column.clone(),
            target_type: cfg.target_type.clone(),
        }),
    })
}

pub fn compile_group_propagation_rule(cfg: &GroupPropagationConfig) -> Result<Rule, SyncError> {
    let name = cfg.name.as_str();
    check_name(name)?;
    if cfg.source_groups.is_empty() || cfg.target_groups.is_empty() {
        return Err(invalid(
            name,
            "`source_groups` and `target_groups` must not be empty",
        ));
    }
    if cfg.target_permissions.is_empty() {
        return Err(invalid(name, "`target_permissions` must not be empty"));
    }

    let source_groups = normalized(&cfg.source_groups);
    let target_groups = normalized(&cfg.target_groups);
    let target_permissions = normalized(&cfg.target_permissions);

    let hash = content_hash(&HashInput {
        kind: "group_propagation",
        source_groups: source_groups.clone(),
        target_groups: target_groups.clone(),
        target_permissions: target_permissions.clone(),
        targets: BTreeMap::new(),
        assign_group: false,
        member_column: None,
        target_type: None,
        group_name: None,
    })?;

    Ok(Rule {
        name: cfg.name.clone(),
        hash,
        kind: RuleKind::GroupPropagation(GroupPropagationRule {
            source_groups,
            target_groups,
            target_permissions,
        }),
    })
}

pub fn owner_rule(plan: &SchemaPlan) -> Rule {
    Rule {
        name: OWNER_RULE_NAME.to_string(),
        hash: OWNER_RULE_HASH.to_string(),
        kind: RuleKind::Owner(OwnerRule {
            dispatch: plan.primary_tables(),
        }),
    }
}

/// Semantic fields of a rule. Computed fields (dispatch maps, closures)
/// stay out.
#[derive(Serialize)]
struct HashInput {
    kind: &'static str,
    source_groups: Vec<String>,
    target_groups: Vec<String>,
    target_permissions: Vec<String>,
    targets: BTreeMap<String, BTreeMap<String, String>>,
    assign_group: bool,
    member_column: Option<String>,
    target_type: Option<IndirectTarget>,
    group_name: Option<GroupNameConfig>,
}

fn content_hash(input: &HashInput) -> Result<String, SyncError> {
    let bytes = serde_json::to_vec(input)?;
    let digest = Sha256::digest(&bytes);
    Ok(base64ct::Base64UrlUnpadded::encode_string(&digest))
}

/// Sorted and deduplicated, so list order never changes the hash.
fn normalized(values: &[String]) -> Vec<String> {
    values
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Rule names end up inside source tags, which are matched as plain text
/// against stored JSON and split at `#`.
fn check_name(name: &str) -> Result<(), SyncError> {
    if name.is_empty() {
        return Err(invalid(name, "rule name must not be empty"));
    }
    if name
        .chars()
        .any(|c| c == '"' || c == '\\' || c == '#' || c.is_control())
    {
        return Err(invalid(
            name,
            "rule names must not contain quotes, backslashes, `#` or control characters",
        ));
    }
    Ok(())
}

fn invalid(rule: &str, reason: &str) -> SyncError {
    SyncError::InvalidRule {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}
