pub mod connect;
pub mod serve;
pub mod tunnel;

use cloudbridge::PeerConnection;

/// Print every payload from `conn` until it closes.
async fn print_inbound(conn: PeerConnection) {
    while let Ok(data) = conn.read().await {
        println!("[{}] {}", conn.peer_id(), String::from_utf8_lossy(&data).trim_end());
    }
    eprintln!("[{}] connection closed", conn.peer_id());
}
