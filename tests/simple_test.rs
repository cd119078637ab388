//! Simple test to verify compilation and basic functionality

use livepoll::{
    Result,
    config::Config,
    engine::VoteEngine,
    store::InMemoryVoteStore,
    templates,
    types::{NewPoll, VoterId},
};
use std::sync::Arc;

#[tokio::test]
async fn test_basic_compilation() -> Result<()> {
    println!("🔧 Testing basic compilation and functionality...");

    // Test configuration
    let config = Config::for_testing();
    config.validate()?;
    assert!(config.engine.max_retries > 0);
    println!("✅ Configuration works");

    // Test poll validation
    let new_poll = NewPoll::new("Tea or coffee?", None, vec!["Tea".into(), "Coffee".into()])?;
    assert_eq!(new_poll.options.len(), 2);
    assert!(NewPoll::new("Only one?", None, vec!["Yes".into()]).is_err());
    println!("✅ Poll validation works");

    // Test engine round trip
    let store = Arc::new(InMemoryVoteStore::new());
    let engine = VoteEngine::new(store, &config)?;
    let poll = engine.create_poll(new_poll, None).await?;
    let voter = VoterId::new("simple-voter")?;
    engine
        .cast_vote(&poll.id, &poll.options[0].id, &voter)
        .await?;
    assert_eq!(engine.tallies(&poll.id).await?.total(), 1);
    println!("✅ Vote engine works");

    // Test templates
    let template = templates::template_by_id("yes-no").expect("yes-no template");
    let from_template = engine.create_poll(template.to_new_poll()?, None).await?;
    assert_eq!(from_template.options.len(), 2);
    println!("✅ Templates work");

    println!("🎉 All basic functionality tests passed!");
    Ok(())
}

#[test]
fn test_blocking_runtime_usage() {
    println!("🧵 Testing engine from a blocking context...");

    let store = Arc::new(InMemoryVoteStore::new());
    let engine = VoteEngine::for_testing(store).unwrap();

    let total = tokio_test::block_on(async {
        let new_poll = NewPoll::new("Lunch?", None, vec!["Pizza".into(), "Sushi".into()])?;
        let poll = engine.create_poll(new_poll, None).await?;
        let voter = VoterId::new("blocking-voter")?;
        engine
            .cast_vote(&poll.id, &poll.options[1].id, &voter)
            .await?;
        Ok::<_, livepoll::Error>(engine.tallies(&poll.id).await?.total())
    })
    .unwrap();

    assert_eq!(total, 1);
    println!("✅ Blocking usage works");
}
