// Dump a recorded session as JSON, the way a timeline viewer would fetch it.
//
// Usage: cargo run --example dump_session -- [DB_PATH] [SESSION_ID] [MAX_POINTS]
//   DB_PATH     default: ./data/sessions.db
//   SESSION_ID  default: list all sessions instead
//   MAX_POINTS  default: 500 (per series)

use proctimeline::session_repo::SessionRepo;
use proctimeline::store::StoreConfig;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let path = args.get(1).map(String::as_str).unwrap_or("./data/sessions.db");
    let session_id: Option<i64> = args.get(2).and_then(|s| s.parse().ok());
    let max_points: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(500);

    let repo = SessionRepo::connect(path).await?;
    repo.init().await?;

    let Some(session_id) = session_id else {
        let sessions = repo.list_sessions().await?;
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    };

    let session = repo.load_session(session_id, StoreConfig::default()).await?;
    let query = session.query();
    let series = query.series();
    let ids: Vec<_> = series.iter().map(|(id, _)| *id).collect();
    let (t0, t1) = query.time_bounds().unwrap_or((0, 0));
    let mut view = query.view(&ids, t0, t1, max_points)?;

    let series: Vec<_> = series
        .into_iter()
        .map(|(id, descriptor)| {
            serde_json::json!({
                "id": id.0,
                "descriptor": descriptor,
                "points": view.remove(&id).unwrap_or_default(),
            })
        })
        .collect();
    let out = serde_json::json!({
        "session": session.info(),
        "window": [t0, t1],
        "series": series,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
