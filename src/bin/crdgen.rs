use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(&oneagent_operator::resources::oneagents::OneAgent::crd())?
    );
    Ok(())
}
