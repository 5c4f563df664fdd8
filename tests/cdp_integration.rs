//! Integration tests against a real headless Chrome, mirroring the mock
//! scenarios end to end. Ignored by default: they need Chrome installed.

#![cfg(feature = "cdp")]

use std::sync::Once;

use htmlshot::{cdp, EngineConfig, RenderRequest, SessionManager};
use tiny_http::{Response, Server};

static INIT: Once = Once::new();

// A 1x1 transparent PNG, enough for the image-settle wait to observe a load.
const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Start a simple test HTTP server that serves one image
fn start_test_server() -> String {
    INIT.call_once(|| {
        std::thread::spawn(|| {
            let server = Server::http("127.0.0.1:18091").unwrap();
            for request in server.incoming_requests() {
                let response = match request.url() {
                    "/pixel.png" => Response::from_data(PIXEL_PNG.to_vec()).with_header(
                        "Content-Type: image/png".parse::<tiny_http::Header>().unwrap(),
                    ),
                    _ => Response::from_data(b"Not Found".to_vec()).with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });
        // Give the server time to start
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    "http://127.0.0.1:18091".to_string()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn renders_png_bytes_for_fitting_content() {
    let manager = SessionManager::new(EngineConfig::default(), cdp::driver_factory());

    let html = r#"<!DOCTYPE html>
<html><body style="margin:0;width:800px;height:1200px;background:#203040">
<h1 style="color:white">poster</h1>
</body></html>"#;

    let result = manager
        .render(RenderRequest::new(html, 800, 1200))
        .await
        .expect("render failed");
    manager.shutdown().await;

    assert_eq!(result.width, 800);
    assert_eq!(result.height, 1200);
    assert_eq!(&result.bytes[0..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn overflowing_content_grows_the_capture() {
    let manager = SessionManager::new(EngineConfig::default(), cdp::driver_factory());

    let html = r#"<!DOCTYPE html>
<html><body style="margin:0">
<div style="width:800px;height:1850px;background:linear-gradient(#fff,#000)"></div>
</body></html>"#;

    let result = manager
        .render(RenderRequest::new(html, 800, 1200))
        .await
        .expect("render failed");
    manager.shutdown().await;

    assert_eq!(result.width, 800);
    assert!(
        result.height >= 1850,
        "capture height {} must cover the content",
        result.height
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn broken_image_urls_do_not_abort_the_render() {
    let base_url = start_test_server();
    let manager = SessionManager::new(EngineConfig::default(), cdp::driver_factory());

    let html = format!(
        r#"<!DOCTYPE html>
<html><body>
<img src="{base_url}/pixel.png">
<img src="{base_url}/does-not-exist.png">
<img src="{base_url}/pixel.png">
</body></html>"#
    );

    let result = manager
        .render(RenderRequest::new(html, 800, 600))
        .await
        .expect("broken images must not abort the render");
    manager.shutdown().await;

    assert!(result.bytes.len() > 100, "PNG data seems too small");
}
