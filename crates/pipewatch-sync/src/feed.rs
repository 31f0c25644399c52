//! Change-feed engine: pure state diffs and the append-only event writer.
//!
//! Callers apply a diff and append its event on the same transaction, so a
//! canonical mutation and its event commit or roll back together.

use std::collections::BTreeSet;

use chrono::{SubsecRound, Utc};
use pipewatch_core::{
    collapse_whitespace, ChangeEvent, ChangePayload, FieldChange, IndicationStatus, Stage, StageDirection, Trial,
    TrialRecord,
};
use sqlx::SqliteConnection;
use tracing::info;

use crate::db::{parse_ts, ts};
use crate::IngestError;

/// Persisted state of one `(asset, indication)` row relevant to diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicationState {
    pub stage: Stage,
    pub status: IndicationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicationDiff {
    Added,
    /// Previously retired row disclosed again.
    Readded,
    StageChanged {
        from: Stage,
        to: Stage,
        direction: StageDirection,
    },
    Unchanged,
}

pub fn diff_indication(existing: Option<IndicationState>, incoming: Stage) -> IndicationDiff {
    match existing {
        None => IndicationDiff::Added,
        Some(state) if state.status == IndicationStatus::Removed => IndicationDiff::Readded,
        Some(state) if state.stage != incoming => IndicationDiff::StageChanged {
            from: state.stage,
            to: incoming,
            direction: StageDirection::between(state.stage, incoming),
        },
        Some(_) => IndicationDiff::Unchanged,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialDiff {
    Added,
    StatusChanged {
        from: Option<String>,
        to: Option<String>,
        changed_fields: Vec<FieldChange>,
    },
    Updated {
        changed_fields: Vec<FieldChange>,
    },
    Unchanged,
}

impl TrialDiff {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, TrialDiff::Unchanged)
    }
}

/// Whitespace-collapsed, deduplicated and sorted intervention names.
pub fn intervention_set(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| collapse_whitespace(n))
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn joined(names: &[String]) -> Option<String> {
    (!names.is_empty()).then(|| names.join("; "))
}

/// Field-level trial diff. A field the record does not report keeps its stored
/// value; an empty intervention list counts as not reported.
pub fn diff_trial(existing: Option<&Trial>, incoming: &TrialRecord) -> TrialDiff {
    let Some(existing) = existing else {
        return TrialDiff::Added;
    };

    let mut changed_fields = Vec::new();
    for (field, old, new) in [
        ("title", &existing.title, &incoming.title),
        ("phase", &existing.phase, &incoming.phase),
        (
            "last_update_posted",
            &existing.last_update_posted,
            &incoming.last_update_posted,
        ),
    ] {
        if new.is_some() && new != old {
            changed_fields.push(FieldChange {
                field: field.to_string(),
                from: old.clone(),
                to: new.clone(),
            });
        }
    }

    let interventions = intervention_set(&incoming.intervention_names);
    if !interventions.is_empty() && interventions != existing.interventions {
        changed_fields.push(FieldChange {
            field: "interventions".to_string(),
            from: joined(&existing.interventions),
            to: joined(&interventions),
        });
    }

    let status_changed =
        incoming.overall_status.is_some() && incoming.overall_status != existing.overall_status;
    if status_changed {
        TrialDiff::StatusChanged {
            from: existing.overall_status.clone(),
            to: incoming.overall_status.clone(),
            changed_fields,
        }
    } else if !changed_fields.is_empty() {
        TrialDiff::Updated { changed_fields }
    } else {
        TrialDiff::Unchanged
    }
}

/// The trial as it reads after applying `incoming` over `existing`.
pub fn merge_trial(existing: Option<&Trial>, incoming: &TrialRecord, company_id: &str) -> Trial {
    let pick = |new: &Option<String>, old: Option<&Option<String>>| {
        new.clone().or_else(|| old.cloned().flatten())
    };
    Trial {
        company_id: company_id.to_string(),
        nct_id: incoming.nct_id.clone(),
        title: pick(&incoming.title, existing.map(|t| &t.title)),
        overall_status: pick(&incoming.overall_status, existing.map(|t| &t.overall_status)),
        phase: pick(&incoming.phase, existing.map(|t| &t.phase)),
        last_update_posted: pick(
            &incoming.last_update_posted,
            existing.map(|t| &t.last_update_posted),
        ),
        interventions: match intervention_set(&incoming.intervention_names) {
            names if names.is_empty() => existing.map(|t| t.interventions.clone()).unwrap_or_default(),
            names => names,
        },
        evidence_id: existing.map(|t| t.evidence_id).unwrap_or_default(),
    }
}

/// Append one event. `occurred_at` never precedes the company's latest event,
/// so id order and `(occurred_at, id)` order agree.
pub async fn append_event(
    conn: &mut SqliteConnection,
    company_id: &str,
    run_id: i64,
    payload: &ChangePayload,
) -> Result<ChangeEvent, IngestError> {
    let event_type = payload.event_type();
    let json = payload.to_json()?;
    let summary = payload.summary();

    let latest: Option<String> =
        sqlx::query_scalar("SELECT MAX(occurred_at) FROM change_events WHERE company_id = ?")
            .bind(company_id)
            .fetch_one(&mut *conn)
            .await?;
    let mut occurred_at = Utc::now().trunc_subsecs(6);
    if let Some(latest) = latest.as_deref().map(parse_ts).transpose()? {
        occurred_at = occurred_at.max(latest);
    }

    let id = sqlx::query(
        "INSERT INTO change_events (company_id, event_type, payload, summary, occurred_at, run_id) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(company_id)
    .bind(event_type.as_str())
    .bind(json.to_string())
    .bind(&summary)
    .bind(ts(occurred_at))
    .bind(run_id)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    info!(event_id = id, event_type = %event_type, company_id, "{summary}");
    Ok(ChangeEvent {
        id,
        company_id: company_id.to_string(),
        event_type,
        payload: json,
        summary,
        occurred_at,
        run_id: Some(run_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(stage: Stage, status: IndicationStatus) -> Option<IndicationState> {
        Some(IndicationState { stage, status })
    }

    fn trial(status: &str, phase: &str) -> Trial {
        Trial {
            company_id: "immatics".into(),
            nct_id: "NCT06946225".into(),
            title: Some("SUPRAME".into()),
            overall_status: Some(status.into()),
            phase: Some(phase.into()),
            last_update_posted: Some("2025-09-01".into()),
            interventions: vec!["IMA203".into()],
            evidence_id: Uuid::nil(),
        }
    }

    fn record(status: Option<&str>, phase: Option<&str>) -> TrialRecord {
        TrialRecord {
            nct_id: "NCT06946225".into(),
            title: Some("SUPRAME".into()),
            overall_status: status.map(Into::into),
            phase: phase.map(Into::into),
            last_update_posted: Some("2025-09-01".into()),
            intervention_names: vec![],
            source_url: String::new(),
            raw_evidence_bytes: vec![],
        }
    }

    #[test]
    fn indication_diffs() {
        assert_eq!(diff_indication(None, Stage::Phase1), IndicationDiff::Added);
        assert_eq!(
            diff_indication(state(Stage::Phase3, IndicationStatus::Confirmed), Stage::Phase3),
            IndicationDiff::Unchanged
        );
        assert_eq!(
            diff_indication(state(Stage::Phase3, IndicationStatus::Unconfirmed), Stage::Phase3),
            IndicationDiff::Unchanged
        );
        assert_eq!(
            diff_indication(state(Stage::Phase3, IndicationStatus::Removed), Stage::Phase3),
            IndicationDiff::Readded
        );
        assert_eq!(
            diff_indication(state(Stage::Phase3, IndicationStatus::Confirmed), Stage::Phase2),
            IndicationDiff::StageChanged {
                from: Stage::Phase3,
                to: Stage::Phase2,
                direction: StageDirection::Downgrade,
            }
        );
        assert_eq!(
            diff_indication(state(Stage::Phase3, IndicationStatus::Confirmed), Stage::Registration),
            IndicationDiff::StageChanged {
                from: Stage::Phase3,
                to: Stage::Registration,
                direction: StageDirection::Advance,
            }
        );
    }

    #[test]
    fn trial_status_change_carries_other_fields() {
        let existing = trial("RECRUITING", "PHASE1");
        let diff = diff_trial(Some(&existing), &record(Some("ACTIVE_NOT_RECRUITING"), Some("PHASE2")));
        assert_eq!(
            diff,
            TrialDiff::StatusChanged {
                from: Some("RECRUITING".into()),
                to: Some("ACTIVE_NOT_RECRUITING".into()),
                changed_fields: vec![FieldChange {
                    field: "phase".into(),
                    from: Some("PHASE1".into()),
                    to: Some("PHASE2".into()),
                }],
            }
        );
    }

    #[test]
    fn trial_field_change_without_status_is_an_update() {
        let existing = trial("RECRUITING", "PHASE1");
        let diff = diff_trial(Some(&existing), &record(Some("RECRUITING"), Some("PHASE1, PHASE2")));
        assert!(matches!(diff, TrialDiff::Updated { ref changed_fields } if changed_fields.len() == 1));
    }

    #[test]
    fn unreported_fields_are_not_changes() {
        let existing = trial("RECRUITING", "PHASE1");
        assert_eq!(diff_trial(Some(&existing), &record(None, None)), TrialDiff::Unchanged);
        assert_eq!(diff_trial(None, &record(None, None)), TrialDiff::Added);

        let merged = merge_trial(Some(&existing), &record(None, Some("PHASE2")), "immatics");
        assert_eq!(merged.overall_status.as_deref(), Some("RECRUITING"));
        assert_eq!(merged.phase.as_deref(), Some("PHASE2"));
    }

    #[test]
    fn intervention_list_changes_are_field_updates() {
        let existing = trial("RECRUITING", "PHASE1");
        let mut incoming = record(Some("RECRUITING"), Some("PHASE1"));
        incoming.intervention_names = vec![
            "Pembrolizumab".into(),
            " IMA203 ".into(),
            "IMA203".into(),
        ];
        assert_eq!(
            diff_trial(Some(&existing), &incoming),
            TrialDiff::Updated {
                changed_fields: vec![FieldChange {
                    field: "interventions".into(),
                    from: Some("IMA203".into()),
                    to: Some("IMA203; Pembrolizumab".into()),
                }],
            }
        );
        let merged = merge_trial(Some(&existing), &incoming, "immatics");
        assert_eq!(merged.interventions, vec!["IMA203", "Pembrolizumab"]);

        incoming.intervention_names = vec!["IMA203".into()];
        assert_eq!(diff_trial(Some(&existing), &incoming), TrialDiff::Unchanged);
    }
}
