use std::future::Future;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::debug;
use tungstenite::Message;

/// The parts of a websocket frame the ticker stream cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Text(String),
    Ping,
    Close(Option<String>),
}

pub type FrameStream = BoxStream<'static, Result<StreamFrame>>;

/// Opens the raw frame stream for a combined-stream URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<FrameStream>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<FrameStream>> + Send {
        let url = url.to_string();
        async move {
            let (ws_stream, response) = connect_async(url.as_str())
                .await
                .with_context(|| format!("Failed to connect to {url}"))?;

            for (header, _value) in response.headers() {
                debug!("\t{header}");
            }

            // Pong replies are queued by tungstenite itself while reading.
            let frames = ws_stream.filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(StreamFrame::Text(text.as_str().to_owned()))),
                    Ok(Message::Ping(_)) => Some(Ok(StreamFrame::Ping)),
                    Ok(Message::Close(frame)) => {
                        Some(Ok(StreamFrame::Close(frame.map(|frame| format!("{:?}", frame)))))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(err.into())),
                }
            });

            Ok(frames.boxed())
        }
    }
}
