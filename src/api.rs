use crate::codec::Value;
use crate::registry::{AccessHandler, DataType, Query, QueryKeys, Registry};
use crate::rpc::RouterHandle;
use crate::services::ServiceManager;
use crate::types::{KernelError, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything a kernel-served request may touch.
pub struct ApiContext {
    pub our: NodeId,
    pub env: HashMap<String, String>,
    pub registry_local: Registry,
    pub registry_global: Registry,
    pub services: Arc<ServiceManager>,
    pub router: RouterHandle,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    Local,
    Global,
}

/// The operations the kernel itself serves. The wire carries dotted method
/// names; they resolve to these variants and nothing else.
#[derive(Clone, Debug)]
pub enum ApiOp {
    KernelEnv,
    KernelExit,
    RegistryCreate {
        scope: Scope,
        key: String,
        data_type: DataType,
        handler: Option<AccessHandler>,
        handler_lua: Option<String>,
    },
    RegistryGet {
        scope: Scope,
        key: String,
        query: Query,
    },
    RegistrySet {
        scope: Scope,
        key: String,
        query: Query,
    },
    RegistryRem {
        scope: Scope,
        key: String,
        query: Query,
    },
    ServiceList,
    ServiceAdd {
        service: String,
        image: String,
        permissions: Vec<String>,
    },
    ServiceRemove {
        service: String,
    },
    ServiceStart {
        service: String,
        num: Option<i64>,
    },
    ServiceStop {
        service: String,
    },
    ServiceScale {
        service: String,
        num: i64,
    },
    NodeConnect {
        node: String,
    },
}

impl ApiOp {
    pub fn parse(
        method: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<ApiOp, KernelError> {
        let arg_str = |i: usize| {
            args.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    KernelError::Route(format!("`{method}` argument {i} must be a string"))
                })
        };
        let arg_int = |i: usize| {
            args.get(i).and_then(Value::as_int).ok_or_else(|| {
                KernelError::Route(format!("`{method}` argument {i} must be an integer"))
            })
        };
        match method {
            "kernel.env" => Ok(ApiOp::KernelEnv),
            "kernel.exit" => Ok(ApiOp::KernelExit),
            "service.list" => Ok(ApiOp::ServiceList),
            "service.add" => Ok(ApiOp::ServiceAdd {
                service: arg_str(0)?,
                image: arg_str(1)?,
                permissions: match args.get(2) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::List(items)) => items
                        .iter()
                        .map(|v| {
                            v.as_str().map(str::to_string).ok_or_else(|| {
                                KernelError::Route(
                                    "permissions must be strings".to_string(),
                                )
                            })
                        })
                        .collect::<Result<_, _>>()?,
                    Some(other) => {
                        return Err(KernelError::Route(format!(
                            "permissions must be a list, got {other:?}"
                        )))
                    }
                },
            }),
            "service.remove" => Ok(ApiOp::ServiceRemove {
                service: arg_str(0)?,
            }),
            "service.start" => Ok(ApiOp::ServiceStart {
                service: arg_str(0)?,
                num: match args.get(1) {
                    None | Some(Value::Null) => None,
                    Some(_) => Some(arg_int(1)?),
                },
            }),
            "service.stop" => Ok(ApiOp::ServiceStop {
                service: arg_str(0)?,
            }),
            "service.scale" => Ok(ApiOp::ServiceScale {
                service: arg_str(0)?,
                num: arg_int(1)?,
            }),
            "node.connect" => Ok(ApiOp::NodeConnect { node: arg_str(0)? }),
            other => {
                let mut parts = other.split('.');
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some("registry"), Some(scope), Some(op), None) => {
                        let scope = match scope {
                            "local" => Scope::Local,
                            "global" => Scope::Global,
                            _ => {
                                return Err(KernelError::Route(format!(
                                    "unknown registry scope in `{method}`"
                                )))
                            }
                        };
                        let key = arg_str(0)?;
                        match op {
                            "create" => Ok(ApiOp::RegistryCreate {
                                scope,
                                key,
                                data_type: parse_data_type(method, kwargs)?,
                                handler: parse_handler(method, kwargs)?,
                                handler_lua: match kwargs.get("handler_lua") {
                                    None | Some(Value::Null) => None,
                                    Some(Value::Str(s)) => Some(s.clone()),
                                    Some(other) => {
                                        return Err(KernelError::Route(format!(
                                            "`{method}`: handler_lua must be a string, got {other:?}"
                                        )))
                                    }
                                },
                            }),
                            "get" => Ok(ApiOp::RegistryGet {
                                scope,
                                key,
                                query: parse_query(method, kwargs)?,
                            }),
                            "set" => Ok(ApiOp::RegistrySet {
                                scope,
                                key,
                                query: parse_query(method, kwargs)?,
                            }),
                            "rem" | "delete" => Ok(ApiOp::RegistryRem {
                                scope,
                                key,
                                query: parse_query(method, kwargs)?,
                            }),
                            _ => Err(KernelError::Route(format!(
                                "unknown api method `{method}`"
                            ))),
                        }
                    }
                    _ => Err(KernelError::Route(format!("unknown api method `{method}`"))),
                }
            }
        }
    }
}

fn parse_data_type(method: &str, kwargs: &BTreeMap<String, Value>) -> Result<DataType, KernelError> {
    match kwargs.get("data_type").or_else(|| kwargs.get("type")) {
        None | Some(Value::Null) => Ok(DataType::Str),
        Some(Value::Str(name)) => DataType::parse(name),
        Some(Value::Int(code)) => DataType::from_code(*code)
            .map_err(|_| KernelError::Route(format!("`{method}`: unknown data type code {code}"))),
        Some(other) => Err(KernelError::Route(format!(
            "`{method}`: uninterpretable data type {other:?}"
        ))),
    }
}

fn parse_handler(
    method: &str,
    kwargs: &BTreeMap<String, Value>,
) -> Result<Option<AccessHandler>, KernelError> {
    match kwargs.get("handler") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(AccessHandler::Flag(*flag))),
        Some(Value::List(pair)) => match pair.as_slice() {
            [Value::Str(service), Value::Str(m)] => {
                Ok(Some(AccessHandler::Rpc(service.clone(), m.clone())))
            }
            _ => Err(KernelError::Route(format!(
                "`{method}`: handler list must be [service, method]"
            ))),
        },
        Some(other) => Err(KernelError::Route(format!(
            "`{method}`: uninterpretable handler {other:?}"
        ))),
    }
}

fn parse_query(method: &str, kwargs: &BTreeMap<String, Value>) -> Result<Query, KernelError> {
    let mut query = Query::none();
    if let Some(data) = kwargs.get("data") {
        if !data.is_null() {
            query.data = Some(serde_json::Value::try_from(data)?);
        }
    }
    match kwargs.get("keys") {
        None | Some(Value::Null) => {}
        Some(Value::List(items)) => {
            let keys = items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        KernelError::Route(format!("`{method}`: keys entries must be strings"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            query.keys = Some(QueryKeys::List(keys));
        }
        Some(Value::Map(fields)) => {
            let mut map = serde_json::Map::new();
            for (field, value) in fields {
                map.insert(field.clone(), serde_json::Value::try_from(value)?);
            }
            query.keys = Some(QueryKeys::Map(map));
        }
        Some(other) => {
            return Err(KernelError::Route(format!(
                "`{method}`: keys must be a list or a map, got {other:?}"
            )))
        }
    }
    Ok(query)
}

pub async fn execute(ctx: &ApiContext, op: ApiOp) -> Result<Value, KernelError> {
    match op {
        ApiOp::KernelEnv => Ok(Value::Map(
            ctx.env
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
        )),
        ApiOp::KernelExit => {
            ctx.router.shutdown();
            Ok(Value::Bool(true))
        }
        ApiOp::RegistryCreate {
            scope,
            key,
            data_type,
            handler,
            handler_lua,
        } => {
            registry(ctx, scope)
                .create(&key, data_type, handler, handler_lua)
                .await?;
            Ok(Value::Bool(true))
        }
        ApiOp::RegistryGet { scope, key, query } => Ok(Value::from(
            registry(ctx, scope).get(&key, &query).await?,
        )),
        ApiOp::RegistrySet { scope, key, query } => {
            registry(ctx, scope).set(&key, &query).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::RegistryRem { scope, key, query } => {
            registry(ctx, scope).rem(&key, &query).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::ServiceList => {
            let listed = ctx.services.list().await?;
            let value = serde_json::to_value(listed)
                .map_err(|e| KernelError::Kv(format!("descriptor encode failed: {e}")))?;
            Ok(Value::from(value))
        }
        ApiOp::ServiceAdd {
            service,
            image,
            permissions,
        } => {
            ctx.services.add(&service, &image, permissions).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::ServiceRemove { service } => {
            ctx.services.remove(&service).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::ServiceStart { service, num } => {
            ctx.services.start(&service, num).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::ServiceStop { service } => {
            ctx.services.stop(&service).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::ServiceScale { service, num } => {
            ctx.services.scale(&service, num).await?;
            Ok(Value::Bool(true))
        }
        ApiOp::NodeConnect { node } => {
            ctx.router.connect_peer(&node).await?;
            Ok(Value::Bool(true))
        }
    }
}

fn registry(ctx: &ApiContext, scope: Scope) -> &Registry {
    match scope {
        Scope::Local => &ctx.registry_local,
        Scope::Global => &ctx.registry_global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_methods() {
        let kwargs = BTreeMap::from([
            ("type".to_string(), Value::from("hash")),
            ("handler".to_string(), Value::Bool(true)),
        ]);
        match ApiOp::parse("registry.local.create", &[Value::from("k")], &kwargs).unwrap() {
            ApiOp::RegistryCreate {
                scope,
                key,
                data_type,
                handler,
                ..
            } => {
                assert_eq!(scope, Scope::Local);
                assert_eq!(key, "k");
                assert_eq!(data_type, DataType::Hash);
                assert_eq!(handler, Some(AccessHandler::Flag(true)));
            }
            other => panic!("parsed to {other:?}"),
        }

        let kwargs = BTreeMap::from([(
            "keys".to_string(),
            Value::List(vec![Value::from("a"), Value::from("b")]),
        )]);
        assert!(matches!(
            ApiOp::parse("registry.global.get", &[Value::from("k")], &kwargs),
            Ok(ApiOp::RegistryGet {
                scope: Scope::Global,
                ..
            })
        ));
    }

    #[test]
    fn parses_rpc_handler_form() {
        let kwargs = BTreeMap::from([(
            "handler".to_string(),
            Value::List(vec![Value::from("guard"), Value::from("check")]),
        )]);
        match ApiOp::parse("registry.local.create", &[Value::from("k")], &kwargs).unwrap() {
            ApiOp::RegistryCreate { handler, .. } => assert_eq!(
                handler,
                Some(AccessHandler::Rpc("guard".to_string(), "check".to_string()))
            ),
            other => panic!("parsed to {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_a_route_error() {
        assert!(matches!(
            ApiOp::parse("registry.local.stack", &[Value::from("k")], &BTreeMap::new()),
            Err(KernelError::Route(_))
        ));
        assert!(matches!(
            ApiOp::parse("warble", &[], &BTreeMap::new()),
            Err(KernelError::Route(_))
        ));
    }

    #[test]
    fn service_methods_take_positional_args() {
        assert!(matches!(
            ApiOp::parse(
                "service.scale",
                &[Value::from("web"), Value::Int(3)],
                &BTreeMap::new()
            ),
            Ok(ApiOp::ServiceScale { num: 3, .. })
        ));
        assert!(matches!(
            ApiOp::parse("service.scale", &[Value::from("web")], &BTreeMap::new()),
            Err(KernelError::Route(_))
        ));
    }
}
