use stress::{stress_test_sessions, stress_test_scaling};
pub mod stress;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║            IOLITE ENGINE STRESS TESTS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: few sessions, many events each
    let stats = stress_test_sessions(4, 200).await;
    stats.print();

    // Test 2: many sessions, fewer events each
    let stats = stress_test_sessions(50, 40).await;
    stats.print();

    // Test 3: scaling analysis
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (sessions)                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(32, 8).await;

    println!("\n✓ All stress tests completed successfully!");
}
