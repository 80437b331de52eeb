//! The fixed dossier step graph.

use super::{InputComponent, ModelTier, StepDefinition, StepGraph};
use crate::errors::ConfigurationError;

/// Step identifiers in declaration order.
pub const DOSSIER_STEP_IDS: &[&str] = &[
    "pitch_intake",
    "classify",
    "harvest_evidence",
    "brief",
    "problem",
    "solution",
    "team",
    "market",
    "competition",
    "business_model",
    "gtm",
    "financial_plan",
    "validate",
    "investor_score",
    "assemble",
];

const SECTION_STEPS: &[&str] = &[
    "problem",
    "solution",
    "team",
    "market",
    "competition",
    "business_model",
    "gtm",
    "financial_plan",
];

/// Forward dependency table: step → direct dependents.
///
/// Walked by the rebuild analyzer. Checked against the declared
/// dependencies when the graph is built.
pub const DOSSIER_DOWNSTREAM: &[(&str, &[&str])] = &[
    (
        "pitch_intake",
        &["classify", "brief", "problem", "solution", "team"],
    ),
    ("classify", &["harvest_evidence", "competition"]),
    ("harvest_evidence", &["brief"]),
    ("brief", &["market", "business_model"]),
    ("problem", &["validate", "assemble"]),
    ("solution", &["validate", "assemble"]),
    ("team", &["validate", "assemble"]),
    ("market", &["gtm", "financial_plan", "validate", "assemble"]),
    ("competition", &["validate", "assemble"]),
    (
        "business_model",
        &["gtm", "financial_plan", "validate", "assemble"],
    ),
    ("gtm", &["validate", "assemble"]),
    ("financial_plan", &["validate", "assemble"]),
    ("validate", &["investor_score", "assemble"]),
    ("investor_score", &["assemble"]),
    ("assemble", &[]),
];

/// Roots invalidated by each input component.
pub const DOSSIER_CHANGE_ROOTS: &[(InputComponent, &[&str])] = &[
    (InputComponent::Pitch, &["pitch_intake"]),
    (InputComponent::Evidence, &["brief"]),
];

fn section(id: &str, name: &str, deps: &[&str], tier: ModelTier) -> StepDefinition {
    let mut step = StepDefinition::new(id, name)
        .with_dependencies(deps.iter().copied())
        .external(tier);
    for dep in deps {
        step = step.reads(match *dep {
            "pitch_intake" => "pitch".to_string(),
            "classify" => "profile".to_string(),
            other if SECTION_STEPS.contains(&other) => format!("sections.{other}"),
            other => other.to_string(),
        });
    }
    step.writes(format!("sections.{id}"))
}

fn dossier_steps() -> Vec<StepDefinition> {
    let mut validate = StepDefinition::new("validate", "Cross-section validation")
        .with_dependencies(SECTION_STEPS.iter().copied())
        .external(ModelTier::Reasoning)
        .writes("validation")
        .with_estimated_ms(9_000);
    let mut assemble = StepDefinition::new("assemble", "Dossier assembly")
        .with_dependencies(
            ["investor_score", "validate"]
                .into_iter()
                .chain(SECTION_STEPS.iter().copied()),
        )
        .reads("input")
        .reads("score")
        .reads("validation")
        .writes("dossier")
        .with_estimated_ms(50);
    for id in SECTION_STEPS {
        let path = format!("sections.{id}");
        validate = validate.reads(path.clone());
        assemble = assemble.reads(path);
    }

    vec![
        StepDefinition::new("pitch_intake", "Pitch intake")
            .reads("input")
            .writes("pitch")
            .with_estimated_ms(20),
        StepDefinition::new("classify", "Project classification")
            .with_dependencies(["pitch_intake"])
            .reads("pitch")
            .writes("profile")
            .external(ModelTier::Fast)
            .with_estimated_ms(3_000),
        StepDefinition::new("harvest_evidence", "Evidence harvesting")
            .with_dependencies(["classify"])
            .reads("input")
            .reads("profile")
            .writes("evidence")
            .external(ModelTier::Fast)
            .critical()
            .with_estimated_ms(12_000),
        StepDefinition::new("brief", "Brief extraction")
            .with_dependencies(["pitch_intake", "harvest_evidence"])
            .reads("pitch")
            .reads("evidence")
            .writes("brief")
            .external(ModelTier::Reasoning)
            .critical()
            .with_estimated_ms(8_000),
        section("problem", "Problem section", &["pitch_intake"], ModelTier::Fast)
            .with_estimated_ms(5_000),
        section("solution", "Solution section", &["pitch_intake"], ModelTier::Fast)
            .with_estimated_ms(5_000),
        section("team", "Team section", &["pitch_intake"], ModelTier::Fast)
            .tolerant()
            .with_estimated_ms(4_000),
        section("market", "Market analysis", &["brief"], ModelTier::Reasoning)
            .critical()
            .with_estimated_ms(10_000),
        section("competition", "Competitive landscape", &["classify"], ModelTier::Reasoning)
            .tolerant()
            .with_estimated_ms(8_000),
        section("business_model", "Business model", &["brief"], ModelTier::Reasoning)
            .critical()
            .with_estimated_ms(8_000),
        section(
            "gtm",
            "Go-to-market",
            &["market", "business_model"],
            ModelTier::Reasoning,
        )
        .with_estimated_ms(7_000),
        section(
            "financial_plan",
            "Financial plan",
            &["market", "business_model"],
            ModelTier::Reasoning,
        )
        .with_estimated_ms(9_000),
        validate,
        StepDefinition::new("investor_score", "Investor scoring")
            .with_dependencies(["validate"])
            .reads("validation")
            .writes("score")
            .external(ModelTier::Reasoning)
            .critical()
            .with_estimated_ms(6_000),
        assemble,
    ]
}

/// Builds the dossier graph with its static forward table and change roots.
///
/// # Errors
///
/// Returns an error if the compiled-in tables disagree with the step
/// declarations.
pub fn dossier_graph() -> Result<StepGraph, ConfigurationError> {
    let mut graph =
        StepGraph::new(dossier_steps())?.with_dependents_table(DOSSIER_DOWNSTREAM)?;
    for (component, roots) in DOSSIER_CHANGE_ROOTS {
        graph = graph.with_change_roots(*component, roots)?;
    }
    Ok(graph)
}
