//! Line-delimited JSON request handling.
//!
//! Each line is one `{"method": ..., "params": ..., "id": ...}` object and
//! gets exactly one response line back, carrying either `result` or
//! `error: {code, message}` where `code` is a negative errno.

use std::path::PathBuf;

use nvctl_bdev::{
    AttachRequest, ControlPlane, DiscoveryRequest, ErrorInjectionRequest, RemoveInjectionRequest,
};
use nvctl_common::{Error, GlobalOptions, PathFilter, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Response {
    fn new(id: Value, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                result: None,
                error: Some(RpcError {
                    code: e.errno(),
                    message: e.message(),
                }),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct OptionalNameParams {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetachParams {
    name: String,
    #[serde(flatten)]
    filter: PathFilter,
}

#[derive(Debug, Deserialize)]
struct HotplugParams {
    enable: bool,
    #[serde(default)]
    period_us: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FirmwareParams {
    filename: PathBuf,
    bdev_name: String,
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::invalid_argument("Missing parameters"))?;
    serde_json::from_value(params).map_err(|e| {
        debug!("Failed to decode parameters: {}", e);
        Error::invalid_argument(format!("Invalid parameters: {e}"))
    })
}

fn decode_optional<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        params => decode(params),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::internal(e.to_string()))
}

/// Decode `params` for `method`, run it against the plane and encode the
/// result.
pub async fn dispatch(plane: &ControlPlane, method: &str, params: Option<Value>) -> Result<Value> {
    match method {
        "bdev_nvme_set_options" => {
            let options: GlobalOptions = decode_optional(params)?;
            plane.set_options(options).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_get_options" => to_value(&plane.get_options()),
        "bdev_nvme_set_hotplug" => {
            let p: HotplugParams = decode(params)?;
            plane.set_hotplug(p.enable, p.period_us).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_attach_controller" => {
            let req: AttachRequest = decode(params)?;
            to_value(&plane.attach_controller(req).await?)
        }
        "bdev_nvme_detach_controller" => {
            let p: DetachParams = decode(params)?;
            plane.detach_controller(&p.name, p.filter).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_get_controllers" => {
            let p: OptionalNameParams = decode_optional(params)?;
            to_value(&plane.get_controllers(p.name.as_deref())?)
        }
        "bdev_nvme_apply_firmware" => {
            let p: FirmwareParams = decode(params)?;
            to_value(&plane.apply_firmware(&p.bdev_name, p.filename).await?)
        }
        "bdev_nvme_get_transport_statistics" => {
            if params.is_some_and(|p| !p.is_null()) {
                return Err(Error::invalid_argument(
                    "'bdev_nvme_get_transport_statistics' requires no arguments",
                ));
            }
            to_value(&plane.get_transport_statistics().await?)
        }
        "bdev_nvme_reset_controller" => {
            let p: NameParams = decode(params)?;
            plane.reset_controller(&p.name).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_get_controller_health_info" => {
            let p: OptionalNameParams = decode_optional(params)?;
            to_value(&plane.get_controller_health_info(p.name.as_deref()).await?)
        }
        "bdev_nvme_start_discovery" => {
            let req: DiscoveryRequest = decode(params)?;
            plane.start_discovery(req).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_stop_discovery" => {
            let p: NameParams = decode(params)?;
            plane.stop_discovery(&p.name).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_get_discovery_info" => to_value(&plane.get_discovery_info()),
        "bdev_nvme_add_error_injection" => {
            let req: ErrorInjectionRequest = decode(params)?;
            plane.add_error_injection(req).await?;
            Ok(Value::Bool(true))
        }
        "bdev_nvme_remove_error_injection" => {
            let req: RemoveInjectionRequest = decode(params)?;
            plane.remove_error_injection(req).await?;
            Ok(Value::Bool(true))
        }
        "bdev_get_bdevs" => to_value(&plane.bdevs().list()),
        _ => Err(Error::invalid_argument(format!("Method not found: {method}"))),
    }
}

/// Handle one request line and return the response line.
pub async fn handle_line(plane: &ControlPlane, line: &str) -> String {
    let response = match serde_json::from_str::<Request>(line) {
        Ok(req) => {
            debug!("Request {}", req.method);
            let outcome = dispatch(plane, &req.method, req.params).await;
            if let Err(e) = &outcome {
                warn!("{} failed: {}", req.method, e);
            }
            Response::new(req.id, outcome)
        }
        Err(e) => Response::new(
            Value::Null,
            Err(Error::invalid_argument(format!("Parse error: {e}"))),
        ),
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(
            r#"{{"id":null,"error":{{"code":{},"message":"{}"}}}}"#,
            -libc::EIO,
            e
        )
    })
}

/// Serve requests from `reader` until it closes, writing responses to
/// `writer`.
pub async fn serve<R, W>(plane: &ControlPlane, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = handle_line(plane, &line).await;
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nvctl_bdev::Transport;
    use nvctl_bdev::sim::{SimTarget, SimTransport};
    use nvctl_common::TransportKind;
    use nvctl_runtime::ReactorPool;

    async fn plane() -> ControlPlane {
        let pool = Arc::new(ReactorPool::start(1).unwrap());
        let sim = Arc::new(SimTransport::new(TransportKind::Tcp));
        sim.add_target(SimTarget::new("10.0.0.1", "4420", "nqn.2016-06.io.spdk:cnode1"));
        let driver: Arc<dyn Transport> = sim;
        ControlPlane::start(pool, driver, GlobalOptions::default())
            .await
            .unwrap()
    }

    fn parse(line: &str) -> Value {
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn test_attach_and_list() {
        let plane = plane().await;
        let line = r#"{"method":"bdev_nvme_attach_controller","id":1,"params":{"name":"Nvme0","trtype":"tcp","traddr":"10.0.0.1","trsvcid":"4420","subnqn":"nqn.2016-06.io.spdk:cnode1"}}"#;
        let response = parse(&handle_line(&plane, line).await);
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"], serde_json::json!(["Nvme0n1"]));

        let response = parse(&handle_line(&plane, r#"{"method":"bdev_nvme_get_controllers","id":2}"#).await);
        assert_eq!(response["result"][0]["name"], "Nvme0");
        assert_eq!(response["result"][0]["ctrlrs"][0]["trid"]["traddr"], "10.0.0.1");

        plane.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_statistics_reject_params() {
        let plane = plane().await;
        let line = r#"{"method":"bdev_nvme_get_transport_statistics","id":3,"params":{"x":1}}"#;
        let response = parse(&handle_line(&plane, line).await);
        assert_eq!(response["error"]["code"], -libc::EINVAL);
        assert_eq!(
            response["error"]["message"],
            "'bdev_nvme_get_transport_statistics' requires no arguments"
        );

        let line = r#"{"method":"bdev_nvme_get_transport_statistics","id":4}"#;
        let response = parse(&handle_line(&plane, line).await);
        assert_eq!(response["result"]["poll_groups"].as_array().unwrap().len(), 2);

        plane.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_carry_errno() {
        let plane = plane().await;
        let response = parse(
            &handle_line(&plane, r#"{"method":"bdev_nvme_reset_controller","id":5,"params":{"name":"Nvme9"}}"#).await,
        );
        assert_eq!(response["error"]["code"], -libc::ENODEV);

        let response = parse(&handle_line(&plane, r#"{"method":"no_such_method","id":6}"#).await);
        assert_eq!(response["error"]["code"], -libc::EINVAL);

        let response = parse(&handle_line(&plane, "not json").await);
        assert!(response["id"].is_null());
        assert_eq!(response["error"]["code"], -libc::EINVAL);

        plane.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_answers_each_line() {
        let plane = plane().await;
        let input = b"{\"method\":\"bdev_nvme_get_discovery_info\",\"id\":1}\n\n{\"method\":\"bdev_get_bdevs\",\"id\":2}\n";
        let mut output = Vec::new();
        serve(&plane, &input[..], &mut output).await.unwrap();

        let lines: Vec<&str> = std::str::from_utf8(&output).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(parse(lines[0])["result"], serde_json::json!([]));

        plane.shutdown().await.unwrap();
    }
}
