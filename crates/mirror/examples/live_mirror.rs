//! Live mirror example - follow the DOM of the first open page
//!
//! Start Chrome with `--remote-debugging-port=9222` and pass the browser
//! WebSocket URL (from `http://localhost:9222/json/version`) as the first
//! argument.

use cdp::{session::page_targets, CDPClient, CDPSession};
use dom_mirror::{DomMirror, MirrorConfig, MirrorUpdate};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cdp_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    println!("Connecting to Chrome at: {}", cdp_url);
    let client = CDPClient::connect(&cdp_url).await?;

    let Some(page) = page_targets(&client).await?.into_iter().next() else {
        println!("No open pages");
        return Ok(());
    };
    println!("Attaching to {} ({})", page.title, page.url);

    let session = CDPSession::attach(client.clone(), page.target_id, None).await?;
    let (mirror, driver) = DomMirror::attach(session, MirrorConfig::default()).await?;
    println!("Mirrored {} nodes", mirror.len());

    if let Some(snapshot) = mirror.to_serializable() {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    for id in mirror.query_selector_all("a[href]", None).await? {
        println!("link {} -> {:?}", id, mirror.selector_hint(id));
    }

    // Print updates for a while; navigate or edit the page to see them
    let mut updates = mirror.subscribe();
    let deadline = tokio::time::sleep(tokio::time::Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            update = updates.recv() => match update {
                Ok(MirrorUpdate::Reset { root, generation }) => {
                    println!("document reloaded: root {} (generation {})", root, generation);
                }
                Ok(update) => println!("{}", serde_json::to_string(&update)?),
                Err(e) => {
                    println!("update stream: {}", e);
                    break;
                }
            },
        }
    }

    driver.abort();
    client.close().await?;
    println!("Disconnected");
    Ok(())
}
