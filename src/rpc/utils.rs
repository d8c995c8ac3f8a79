use crate::codec::Value;
use crate::types::{InstanceId, KernelError, NodeId, ServiceAddr};
use std::collections::BTreeMap;

pub const OP_CONNECT: &str = "connect";
pub const OP_CONNECT_NODE: &str = "connect_node";
pub const OP_REQUEST: &str = "request";
pub const OP_RESPONSE: &str = "response";
pub const OP_PROXY: &str = "proxy";
pub const OP_PROXY_STATUS: &str = "proxy_status";

/// One decoded, shape-checked frame.
#[derive(Clone, Debug)]
pub enum Frame {
    Connect {
        service: String,
        instance: InstanceId,
        token: String,
    },
    ConnectNode {
        node: NodeId,
        token: String,
    },
    Request {
        node: Option<NodeId>,
        service: String,
        instance: Option<InstanceId>,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        rid: Option<String>,
    },
    Response {
        result: Value,
        error: Value,
        rid: Option<String>,
    },
    Proxy {
        node: NodeId,
        origin: ServiceAddr,
        inner: Vec<Value>,
        proxy_rid: String,
    },
    ProxyStatus {
        error: Value,
        proxy_rid: String,
    },
}

pub fn parse(mut frame: Vec<Value>) -> Result<Frame, KernelError> {
    if frame.is_empty() {
        return Err(KernelError::Route("empty frame".to_string()));
    }
    let body = frame.split_off(1);
    let opcode = frame
        .pop()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| KernelError::Route("opcode is not a string".to_string()))?;
    match opcode.as_str() {
        OP_CONNECT => {
            let [service, instance, token, _params] = shape::<4>(&opcode, body)?;
            Ok(Frame::Connect {
                service: want_str(&opcode, service)?,
                instance: want_int(&opcode, instance)?,
                token: want_str(&opcode, token)?,
            })
        }
        OP_CONNECT_NODE => {
            let [node, token, _params] = shape::<3>(&opcode, body)?;
            Ok(Frame::ConnectNode {
                node: want_str(&opcode, node)?,
                token: want_str(&opcode, token)?,
            })
        }
        OP_REQUEST => {
            let [target, method, args, kwargs, rid] = shape::<5>(&opcode, body)?;
            let target = match target {
                Value::List(triple) if triple.len() == 3 => triple,
                other => {
                    return Err(KernelError::Route(format!(
                        "request target is not a triple: {other:?}"
                    )))
                }
            };
            let mut target = target.into_iter();
            let node = match target.next().expect("triple length checked") {
                Value::Null => None,
                Value::Str(s) => Some(s),
                other => {
                    return Err(KernelError::Route(format!(
                        "target node is not a string: {other:?}"
                    )))
                }
            };
            let service = want_str(&opcode, target.next().expect("triple length checked"))?;
            let instance = opt_int(&opcode, target.next().expect("triple length checked"))?;
            Ok(Frame::Request {
                node,
                service,
                instance,
                method: want_str(&opcode, method)?,
                args: match args {
                    Value::List(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(KernelError::Route(format!(
                            "request args is not a list: {other:?}"
                        )))
                    }
                },
                kwargs: match kwargs {
                    Value::Map(m) => m,
                    Value::Null => BTreeMap::new(),
                    other => {
                        return Err(KernelError::Route(format!(
                            "request kwargs is not a map: {other:?}"
                        )))
                    }
                },
                rid: opt_str(&opcode, rid)?,
            })
        }
        OP_RESPONSE => {
            let [result, error, rid] = shape::<3>(&opcode, body)?;
            Ok(Frame::Response {
                result,
                error,
                rid: opt_str(&opcode, rid)?,
            })
        }
        OP_PROXY => {
            let [node, origin, inner, proxy_rid] = shape::<4>(&opcode, body)?;
            Ok(Frame::Proxy {
                node: want_str(&opcode, node)?,
                origin: parse_addr(&origin)?,
                inner: match inner {
                    Value::List(items) => items,
                    other => {
                        return Err(KernelError::Route(format!(
                            "proxied command is not a list: {other:?}"
                        )))
                    }
                },
                proxy_rid: want_str(&opcode, proxy_rid)?,
            })
        }
        OP_PROXY_STATUS => {
            let [error, proxy_rid] = shape::<2>(&opcode, body)?;
            Ok(Frame::ProxyStatus {
                error,
                proxy_rid: want_str(&opcode, proxy_rid)?,
            })
        }
        other => Err(KernelError::Route(format!("unexpected route case: {other}"))),
    }
}

fn shape<const N: usize>(opcode: &str, body: Vec<Value>) -> Result<[Value; N], KernelError> {
    <[Value; N]>::try_from(body)
        .map_err(|got| KernelError::Route(format!("malformed `{opcode}`: {} slots", got.len())))
}

fn want_str(opcode: &str, v: Value) -> Result<String, KernelError> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(KernelError::Route(format!(
            "`{opcode}`: expected string, got {other:?}"
        ))),
    }
}

fn opt_str(opcode: &str, v: Value) -> Result<Option<String>, KernelError> {
    match v {
        Value::Null => Ok(None),
        Value::Str(s) => Ok(Some(s)),
        other => Err(KernelError::Route(format!(
            "`{opcode}`: expected string or null, got {other:?}"
        ))),
    }
}

fn want_int(opcode: &str, v: Value) -> Result<i64, KernelError> {
    match v {
        Value::Int(i) => Ok(i),
        Value::Str(s) => s
            .parse()
            .map_err(|_| KernelError::Route(format!("`{opcode}`: uncoercible instance `{s}`"))),
        other => Err(KernelError::Route(format!(
            "`{opcode}`: expected integer, got {other:?}"
        ))),
    }
}

fn opt_int(opcode: &str, v: Value) -> Result<Option<i64>, KernelError> {
    match v {
        Value::Null => Ok(None),
        other => want_int(opcode, other).map(Some),
    }
}

pub fn addr_value(addr: &ServiceAddr) -> Value {
    Value::List(vec![
        Value::from(addr.node.clone()),
        Value::from(addr.service.clone()),
        Value::Int(addr.instance),
    ])
}

pub fn parse_addr(v: &Value) -> Result<ServiceAddr, KernelError> {
    let triple = v
        .as_list()
        .filter(|l| l.len() == 3)
        .ok_or_else(|| KernelError::Route(format!("identity is not a triple: {v:?}")))?;
    Ok(ServiceAddr {
        node: triple[0]
            .as_str()
            .ok_or_else(|| KernelError::Route("identity node is not a string".to_string()))?
            .to_string(),
        service: triple[1]
            .as_str()
            .ok_or_else(|| KernelError::Route("identity service is not a string".to_string()))?
            .to_string(),
        instance: triple[2]
            .as_int()
            .ok_or_else(|| KernelError::Route("identity instance is not an integer".to_string()))?,
    })
}

fn rid_value(rid: &Option<String>) -> Value {
    rid.clone().into()
}

/// The error tuple carried in response and proxy_status frames:
/// `[module_qualified_name, message, textual_traceback]`.
pub fn error_value(err: &KernelError) -> Value {
    Value::List(vec![
        Value::from(err.wire_name()),
        Value::from(err.to_string()),
        Value::from(format!("{}: {}", err.wire_name(), err)),
    ])
}

/// A `request` frame as delivered to its target, origin triple first.
pub fn request_frame(
    origin: &ServiceAddr,
    method: &str,
    args: &[Value],
    kwargs: &BTreeMap<String, Value>,
    rid: &Option<String>,
) -> Vec<Value> {
    vec![
        Value::from(OP_REQUEST),
        addr_value(origin),
        Value::from(method),
        Value::List(args.to_vec()),
        Value::Map(kwargs.clone()),
        rid_value(rid),
    ]
}

/// A `request` frame as forwarded toward another node, target triple first.
pub fn forwarded_request_frame(
    node: &str,
    service: &str,
    instance: InstanceId,
    method: &str,
    args: &[Value],
    kwargs: &BTreeMap<String, Value>,
    rid: &Option<String>,
) -> Vec<Value> {
    vec![
        Value::from(OP_REQUEST),
        Value::List(vec![
            Value::from(node),
            Value::from(service),
            Value::Int(instance),
        ]),
        Value::from(method),
        Value::List(args.to_vec()),
        Value::Map(kwargs.clone()),
        rid_value(rid),
    ]
}

pub fn response_frame(result: Value, error: Value, rid: &str) -> Vec<Value> {
    vec![
        Value::from(OP_RESPONSE),
        result,
        error,
        Value::from(rid),
    ]
}

pub fn error_response_frame(err: &KernelError, rid: &str) -> Vec<Value> {
    response_frame(Value::Null, error_value(err), rid)
}

pub fn proxy_frame(
    node: &str,
    origin: &ServiceAddr,
    inner: Vec<Value>,
    proxy_rid: &str,
) -> Vec<Value> {
    vec![
        Value::from(OP_PROXY),
        Value::from(node),
        addr_value(origin),
        Value::List(inner),
        Value::from(proxy_rid),
    ]
}

pub fn proxy_status_frame(err: &KernelError, proxy_rid: &str) -> Vec<Value> {
    vec![
        Value::from(OP_PROXY_STATUS),
        error_value(err),
        Value::from(proxy_rid),
    ]
}

pub fn connect_node_frame(node: &str, token: &str) -> Vec<Value> {
    vec![
        Value::from(OP_CONNECT_NODE),
        Value::from(node),
        Value::from(token),
        Value::Map(BTreeMap::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_sentinels() {
        let frame = vec![
            Value::from(OP_REQUEST),
            Value::List(vec![Value::Null, Value::from("b"), Value::Null]),
            Value::from("add"),
            Value::List(vec![Value::Int(2), Value::Int(3)]),
            Value::Map(BTreeMap::new()),
            Value::from("r1"),
        ];
        match parse(frame).unwrap() {
            Frame::Request {
                node,
                service,
                instance,
                method,
                args,
                rid,
                ..
            } => {
                assert_eq!(node, None);
                assert_eq!(service, "b");
                assert_eq!(instance, None);
                assert_eq!(method, "add");
                assert_eq!(args.len(), 2);
                assert_eq!(rid, Some("r1".to_string()));
            }
            other => panic!("parsed to {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let frame = vec![Value::from("warble")];
        assert!(matches!(parse(frame), Err(KernelError::Route(_))));
    }

    #[test]
    fn rejects_malformed_shape() {
        let frame = vec![Value::from(OP_RESPONSE), Value::Null];
        assert!(matches!(parse(frame), Err(KernelError::Route(_))));
    }

    #[test]
    fn proxy_roundtrip() {
        let origin = ServiceAddr::new("n1", "a", 1);
        let inner = response_frame(Value::Int(5), Value::Null, "r1");
        let frame = proxy_frame("n2", &origin, inner.clone(), "p1");
        match parse(frame).unwrap() {
            Frame::Proxy {
                node,
                origin: parsed,
                inner: got,
                proxy_rid,
            } => {
                assert_eq!(node, "n2");
                assert_eq!(parsed, origin);
                assert_eq!(got, inner);
                assert_eq!(proxy_rid, "p1");
            }
            other => panic!("parsed to {other:?}"),
        }
    }
}
