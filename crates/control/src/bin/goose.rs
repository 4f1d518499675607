use goose::prelude::*;
use rand::Rng;
use serde_json::json;

/// Small programs per language; each prints a marker the check looks for.
const SNIPPETS: &[(&str, &str)] = &[
    ("javascript", "console.log('sandpool-ok')"),
    ("python", "print('sandpool-ok')"),
    (
        "java",
        "public class Main { public static void main(String[] a) { System.out.println(\"sandpool-ok\"); } }",
    ),
    ("csharp", "System.Console.WriteLine(\"sandpool-ok\");"),
];

async fn setup_custom_client(user: &mut GooseUser) -> TransactionResult {
    use reqwest::Client;

    let builder = Client::builder().cookie_store(true).gzip(true);
    user.set_client_builder(builder).await?;
    Ok(())
}

fn run_payload() -> serde_json::Value {
    let (language, code) = SNIPPETS[rand::rng().random_range(0..SNIPPETS.len())];
    json!({ "language": language, "code": code })
}

async fn run_roundtrip(user: &mut GooseUser) -> TransactionResult {
    let payload = run_payload();
    let mut goose = user.post_json("/run", &payload).await?;
    let response = goose
        .response
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TransactionError::from)
        .map_err(Box::new)?;
    if !status.is_success() {
        return user.set_failure(
            &format!("status {}", status.as_u16()),
            &mut goose.request,
            None,
            Some(&body),
        );
    }
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return user.set_failure("invalid json", &mut goose.request, None, Some(&body)),
    };
    let output = parsed.get("output").and_then(|value| value.as_str());
    if !output.is_some_and(|output| output.contains("sandpool-ok")) {
        return user.set_failure("unexpected output", &mut goose.request, None, Some(&body));
    }
    Ok(())
}

async fn pools_snapshot(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/pools").await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("run_roundtrip")
                .register_transaction(transaction!(setup_custom_client).set_on_start())
                .register_transaction(transaction!(run_roundtrip).set_weight(9)?)
                .register_transaction(transaction!(pools_snapshot)),
        )
        .execute()
        .await?;
    Ok(())
}
