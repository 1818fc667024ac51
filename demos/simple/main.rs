use std::sync::Arc;

use abkit::{
    Experiment, ExperimentStatus, InMemoryExperimentSource, RuleOperator, ServiceConfig,
    SqliteAssignmentStore, TargetingRule, UserContext, Variant,
};

pub fn main() -> abkit::Result<()> {
    // Configure env_logger to see abkit logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("abkit")).init();

    let experiments = Arc::new(InMemoryExperimentSource::new());
    experiments.create(
        Experiment::new(
            "homepage-cta",
            "Homepage call to action",
            vec![Variant::new("A", 50.0), Variant::new("B", 50.0)],
        )
        .with_rules(vec![TargetingRule::new(
            "deviceType",
            RuleOperator::In,
            vec!["mobile", "tablet"],
        )]),
    )?;
    experiments.set_status("homepage-cta", ExperimentStatus::Running)?;

    let path = std::env::var("ABKIT_DB")
        .unwrap_or_else(|_| std::env::temp_dir().join("abkit-demo.db").display().to_string());
    let store = Arc::new(SqliteAssignmentStore::open(&path)?);

    let service = ServiceConfig::new()
        .assignment_logger(|event| {
            println!("Logging assignment event: {:?}", event);
        })
        .to_service(experiments.clone(), store);

    for (user_id, device_type) in [("user-1", "mobile"), ("user-2", "desktop"), ("user-3", "tablet")] {
        let context = UserContext::new().with_device_type(device_type);
        let variant = service.assign_variant("homepage-cta", user_id, "demo-session", Some(context))?;
        println!("{user_id} ({device_type}): {variant:?}");
    }

    // Returning users keep their variant, even without context.
    let variant = service.assign_variant("homepage-cta", "user-1", "another-session", None)?;
    println!("user-1 again: {variant:?}");

    Ok(())
}
