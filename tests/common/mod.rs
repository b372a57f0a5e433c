//! In-memory API server and recording observer shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use k8s_openapi::api::core::v1::Secret;
use kube::client::Body;
use kube::{Client, Resource};
use serde::Serialize;
use serde_json::{json, Value};

use converge_operator::updater::drift::effective_secret_data;
use converge_operator::updater::patch::apply_merge_patch;
use converge_operator::updater::selector::Operator;
use converge_operator::updater::{PlanSummary, ResourceKind, Selector, UpdateObserver};
use converge_operator::Error;

/// `(plural, namespace, name)`; namespace is empty for cluster-scoped objects
type ObjectKey = (String, String, String);

/// One request as seen by the fake server
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub plural: String,
    pub namespace: String,
    pub name: Option<String>,
    pub subresource: Option<String>,
    pub body: Value,
}

impl Recorded {
    pub fn is_mutation(&self) -> bool {
        self.method != Method::GET
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    requests: Vec<Recorded>,
    /// `(method, plural, name)` -> status code returned instead of serving
    faults: HashMap<(Method, String, Option<String>), u16>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Stateful stand-in for the Kubernetes API server.
///
/// Serves list, create, merge patch (including `/status`) and delete for any
/// resource path, enforces `metadata.resourceVersion` on patches and folds
/// Secret `stringData` into `data` the way the real server does.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<State>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> Client {
        let state = Arc::clone(&self.state);
        let service = tower::service_fn(move |req: Request<Body>| {
            let state = Arc::clone(&state);
            async move { Ok::<_, Infallible>(handle(state, req).await) }
        });
        Client::new(service, "default")
    }

    /// Store an object as if it had been created earlier
    pub fn seed<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let plural = K::plural(&()).to_string();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(obj).unwrap();

        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        value["metadata"]["resourceVersion"] = json!(version);
        fold_string_data(&plural, &mut value);
        state.objects.insert((plural, namespace, name), value);
    }

    pub fn get(&self, plural: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(plural.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn names(&self, plural: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(p, _, _)| p == plural)
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn mutations(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(Recorded::is_mutation)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    /// Answer `method` on `plural` (and `name`, when given) with `code`
    pub fn fail(&self, method: Method, plural: &str, name: Option<&str>, code: u16) {
        self.state.lock().unwrap().faults.insert(
            (method, plural.to_string(), name.map(str::to_string)),
            code,
        );
    }
}

struct Target {
    plural: String,
    namespace: String,
    name: Option<String>,
    subresource: Option<String>,
}

/// `/api/v1[/namespaces/{ns}]/{plural}[/{name}[/{sub}]]` or the `/apis/{group}/{version}` form
fn parse_path(path: &str) -> Option<Target> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let rest = match segments.first()? {
        &"api" => &segments[2..],
        &"apis" => &segments[3..],
        _ => return None,
    };
    let (namespace, rest) = match rest {
        ["namespaces", ns, rest @ ..] if !rest.is_empty() => (ns.to_string(), rest),
        _ => (String::new(), rest),
    };
    Some(Target {
        plural: rest.first()?.to_string(),
        namespace,
        name: rest.get(1).map(|s| s.to_string()),
        subresource: rest.get(2).map(|s| s.to_string()),
    })
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).unwrap()
}

fn labels_of(obj: &Value) -> BTreeMap<String, String> {
    obj["metadata"]["labels"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Mirror the server: `stringData` is write-only and lands base64-encoded in `data`
fn fold_string_data(plural: &str, obj: &mut Value) {
    if plural != "secrets" || obj.get("stringData").is_none() {
        return;
    }
    let secret: Secret = serde_json::from_value(obj.clone()).unwrap();
    let data = effective_secret_data(&secret);
    let map = obj.as_object_mut().unwrap();
    map.remove("stringData");
    map.insert("data".to_string(), serde_json::to_value(data).unwrap());
}

fn respond(code: StatusCode, body: &Value) -> Response<Body> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn status(code: StatusCode, reason: &str, message: &str) -> Response<Body> {
    respond(
        code,
        &json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "reason": reason,
            "message": message,
            "code": code.as_u16()
        }),
    )
}

async fn handle(state: Arc<Mutex<State>>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let bytes = req.into_body().collect().await.unwrap().to_bytes();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    let Some(target) = parse_path(&path) else {
        return status(StatusCode::NOT_FOUND, "NotFound", &path);
    };

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.clone(),
        plural: target.plural.clone(),
        namespace: target.namespace.clone(),
        name: target.name.clone(),
        subresource: target.subresource.clone(),
        body: body.clone(),
    });

    let fault = state
        .faults
        .get(&(method.clone(), target.plural.clone(), target.name.clone()))
        .or_else(|| state.faults.get(&(method.clone(), target.plural.clone(), None)))
        .copied();
    if let Some(code) = fault {
        let code = StatusCode::from_u16(code).unwrap();
        return status(code, "InjectedFault", "injected failure");
    }

    match (method, target.name.clone()) {
        (Method::GET, None) => list(&state, &target, query.as_deref()),
        (Method::GET, Some(name)) => {
            let key = (target.plural.clone(), target.namespace.clone(), name);
            match state.objects.get(&key) {
                Some(obj) => respond(StatusCode::OK, obj),
                None => status(StatusCode::NOT_FOUND, "NotFound", "not found"),
            }
        }
        (Method::POST, None) => create(&mut state, &target, body),
        (Method::PATCH, Some(name)) => patch(&mut state, &target, &name, body),
        (Method::DELETE, Some(name)) => {
            let key = (target.plural.clone(), target.namespace.clone(), name);
            match state.objects.remove(&key) {
                Some(obj) => respond(StatusCode::OK, &obj),
                None => status(StatusCode::NOT_FOUND, "NotFound", "not found"),
            }
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", &path),
    }
}

fn list(state: &State, target: &Target, query: Option<&str>) -> Response<Body> {
    let selector = query_param(query, "labelSelector")
        .map(|s| Selector::parse(&s))
        .unwrap_or_default();
    let items: Vec<Value> = state
        .objects
        .iter()
        .filter(|((plural, ns, _), _)| {
            *plural == target.plural && (target.namespace.is_empty() || *ns == target.namespace)
        })
        .filter(|(_, obj)| server_matches(&selector, &labels_of(obj)))
        .map(|(_, obj)| obj.clone())
        .collect();
    respond(
        StatusCode::OK,
        &json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": { "resourceVersion": state.resource_version.to_string() },
            "items": items
        }),
    )
}

/// Label matching as the apiserver does it: values compare exactly, and
/// `!=`/`notin` hold when the key is absent
fn server_matches(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    selector.clauses().iter().all(|clause| {
        let actual = labels.get(&clause.key);
        let any_equal = actual.is_some_and(|a| clause.values.iter().any(|v| v == a));
        match clause.operator {
            Operator::Equals | Operator::In => any_equal,
            Operator::NotEquals | Operator::NotIn => !any_equal,
        }
    })
}

fn create(state: &mut State, target: &Target, mut body: Value) -> Response<Body> {
    let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
    let key = (target.plural.clone(), target.namespace.clone(), name.clone());
    if state.objects.contains_key(&key) {
        return status(StatusCode::CONFLICT, "AlreadyExists", &name);
    }
    if !target.namespace.is_empty() {
        body["metadata"]["namespace"] = json!(target.namespace);
    }
    body["metadata"]["resourceVersion"] = json!(state.next_version());
    fold_string_data(&target.plural, &mut body);
    state.objects.insert(key, body.clone());
    respond(StatusCode::CREATED, &body)
}

fn patch(state: &mut State, target: &Target, name: &str, body: Value) -> Response<Body> {
    let key = (target.plural.clone(), target.namespace.clone(), name.to_string());
    let version = state.next_version();
    let Some(current) = state.objects.get_mut(&key) else {
        return status(StatusCode::NOT_FOUND, "NotFound", name);
    };

    if let Some(expected) = body["metadata"]["resourceVersion"].as_str() {
        if current["metadata"]["resourceVersion"].as_str() != Some(expected) {
            return status(StatusCode::CONFLICT, "Conflict", "the object has been modified");
        }
    }

    apply_merge_patch(current, &body);
    current["metadata"]["resourceVersion"] = json!(version);
    fold_string_data(&target.plural, current);
    respond(StatusCode::OK, current)
}

/// Everything the updater reported, in order
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Plan(PlanSummary, bool),
    Create(ResourceKind, String),
    Patch(ResourceKind, String),
    Delete(ResourceKind, String),
    Error(ResourceKind, String),
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn plan_for(&self, kind: ResourceKind) -> Option<PlanSummary> {
        self.events().into_iter().find_map(|e| match e {
            Event::Plan(summary, _) if summary.kind == kind => Some(summary),
            _ => None,
        })
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl UpdateObserver for RecordingObserver {
    fn on_plan(&self, _namespace: &str, summary: &PlanSummary, dry_run: bool) {
        self.push(Event::Plan(summary.clone(), dry_run));
    }

    fn on_create(&self, kind: ResourceKind, _namespace: &str, name: &str) {
        self.push(Event::Create(kind, name.to_string()));
    }

    fn on_patch(&self, kind: ResourceKind, _namespace: &str, name: &str) {
        self.push(Event::Patch(kind, name.to_string()));
    }

    fn on_delete(&self, kind: ResourceKind, _namespace: &str, name: &str) {
        self.push(Event::Delete(kind, name.to_string()));
    }

    fn on_error(&self, kind: ResourceKind, _namespace: &str, error: &Error) {
        self.push(Event::Error(kind, error.to_string()));
    }
}
