//! Session orchestrator - wires user actions to the engines
//!
//! A send runs: scope merge, pre-request script, custom auth signature,
//! wire construction, dispatch, post-response script, history record and
//! retention sweep. Variables written by scripts live in a session layer
//! that sits above the request scope for the rest of the session.

use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_COLLECTION_NAME;
use crate::curl;
use crate::error::{DispatchError, SessionError, StoreError};
use crate::import_export::{self, Imported};
use crate::models::{
    new_id, Auth, Collection, CollectionItem, HistoryEntry, HistoryError, HttpResponse, KeyValue,
    Request, ScopeKind, Settings, VarMap, VariableScope,
};
use crate::network::{build_raw_request, DispatchEngine, DispatchOptions};
use crate::script::{ScriptContext, ScriptResult, ScriptSandbox};
use crate::storage::Store;
use crate::variables;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything one send produced
#[derive(Debug)]
pub struct SendReport {
    /// The request after pre-request mutations, before variable expansion
    pub request: Request,
    pub outcome: std::result::Result<HttpResponse, DispatchError>,
    pub pre_script: Option<ScriptResult>,
    pub post_script: Option<ScriptResult>,
    pub history_id: String,
    /// Variables in effect once both scripts ran
    pub variables: VarMap,
}

impl SendReport {
    pub fn response(&self) -> Option<&HttpResponse> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&DispatchError> {
        self.outcome.as_ref().err()
    }
}

pub struct Session {
    store: Store,
    engine: DispatchEngine,
    scripts: ScriptSandbox,
    session_vars: VarMap,
}

impl Session {
    /// Open a session over `store`: sweep expired history and make sure a
    /// default collection exists.
    pub fn open(mut store: Store, engine: DispatchEngine, scripts: ScriptSandbox) -> Result<Self> {
        let settings = store.get_settings()?;
        store.enforce_retention(
            settings.history_expire_days,
            settings.max_history_size,
            Utc::now(),
        )?;

        if store.get_all_collections()?.is_empty() {
            store.put_collection(&Collection::new(DEFAULT_COLLECTION_NAME))?;
            tracing::info!("Created default collection");
        }

        tracing::info!(transport = engine.transport_name(), "Session opened");
        Ok(Session {
            store,
            engine,
            scripts,
            session_vars: VarMap::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(self.store.get_settings()?)
    }

    pub fn save_settings(&mut self, mut settings: Settings) -> Result<()> {
        settings.updated_at = Utc::now();
        self.store.save_settings(&settings)?;
        Ok(())
    }

    /// A blank request carrying the configured default headers
    pub fn new_request(&self) -> Result<Request> {
        Ok(self.store.get_settings()?.new_request())
    }

    pub fn session_variables(&self) -> &VarMap {
        &self.session_vars
    }

    pub fn set_session_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.session_vars.insert(key.into(), value.into());
    }

    pub fn clear_session_variables(&mut self) {
        self.session_vars.clear();
    }

    // ---- collections and requests ----

    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let collection = Collection::new(name);
        self.store.put_collection(&collection)?;
        Ok(collection)
    }

    /// Persist a request. If it names a collection that does not list it
    /// yet, it is appended to that collection's tree.
    pub fn save_request(&self, request: &mut Request) -> Result<()> {
        request.touch();
        if let Some(collection_id) = request.collection_id.clone() {
            let mut collection = self
                .store
                .get_collection(&collection_id)?
                .ok_or(StoreError::NotFound {
                    store: "collections",
                    id: collection_id,
                })?;
            if !collection.request_ids().contains(&request.id) {
                collection.add_request(request);
                self.store.put_collection(&collection)?;
            }
        }
        self.store.put_request(request)?;
        Ok(())
    }

    /// Delete a request and drop it from its collection's tree.
    pub fn delete_request(&self, id: &str) -> Result<bool> {
        if let Some(request) = self.store.get_request(id)? {
            if let Some(collection_id) = &request.collection_id {
                if let Some(mut collection) = self.store.get_collection(collection_id)? {
                    if remove_ref(&mut collection.items, id) {
                        collection.updated_at = Utc::now();
                        self.store.put_collection(&collection)?;
                    }
                }
            }
        }
        Ok(self.store.delete_request(id)?)
    }

    /// Delete a collection together with its requests.
    pub fn delete_collection(&mut self, id: &str) -> Result<usize> {
        Ok(self.store.delete_collection(id)?)
    }

    // ---- import / export ----

    /// Import a JSON document and persist what it contained.
    pub fn import_json(&mut self, text: &str) -> Result<Imported> {
        let imported = import_export::import_json(text)?;
        match &imported {
            Imported::Request(request) => self.store.put_request(request)?,
            Imported::Collection(collection, requests) => {
                self.store.import_collection(collection, requests)?
            }
        }
        Ok(imported)
    }

    /// Decode a curl command into a request (not persisted).
    pub fn import_curl(&self, command: &str) -> Result<Request> {
        Ok(curl::parse_curl(command)?)
    }

    pub fn export_request(&self, id: &str) -> Result<String> {
        let request = self.store.get_request(id)?.ok_or(StoreError::NotFound {
            store: "requests",
            id: id.to_string(),
        })?;
        Ok(import_export::export_request_json(&request)?)
    }

    pub fn export_collection(&self, id: &str) -> Result<String> {
        let collection = self.store.get_collection(id)?.ok_or(StoreError::NotFound {
            store: "collections",
            id: id.to_string(),
        })?;
        let requests = self.store.get_requests_by_collection(id)?;
        let json = import_export::export_collection_json(&collection, |rid| {
            requests.iter().find(|r| r.id == rid).cloned()
        })?;
        Ok(json)
    }

    // ---- history ----

    pub fn history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.get_history(limit, offset)?)
    }

    /// Re-open a history entry as an editable request.
    pub fn reopen_history(&self, id: &str) -> Result<Request> {
        let entry = self.store.get_history_entry(id)?.ok_or(StoreError::NotFound {
            store: "history",
            id: id.to_string(),
        })?;
        Ok(entry.to_request()?)
    }

    // ---- sending ----

    /// Variable scopes for `request`, lowest precedence first
    pub fn scopes_for(&self, request: &Request) -> Result<Vec<VariableScope>> {
        let settings = self.store.get_settings()?;
        let mut scopes = vec![VariableScope::global(settings.variables)];
        if let Some(collection_id) = &request.collection_id {
            if let Some(collection) = self.store.get_collection(collection_id)? {
                scopes.push(VariableScope::collection(&collection));
            }
        }
        scopes.push(VariableScope::from_map("session", ScopeKind::Request, &self.session_vars));
        Ok(scopes)
    }

    /// Run the full send pipeline for `request`.
    ///
    /// Validation failures and a failing pre-request or signature script
    /// return `Err` and record nothing. Every attempted dispatch, failed or
    /// cancelled ones included, is recorded in history and reported in
    /// [`SendReport::outcome`]. The stored request is never modified.
    pub async fn send(&mut self, request: &Request, cancel: CancellationToken) -> Result<SendReport> {
        let settings = self.store.get_settings()?;
        let merged = variables::merge(&self.scopes_for(request)?);
        let mut ctx = ScriptContext::new(request.clone(), merged.clone());

        let pre_script = match non_empty(&request.scripts.pre_request) {
            Some(script) => {
                let (result, updated) = self
                    .blocking(move |sandbox| {
                        let result = sandbox.run_pre_request(&script, &mut ctx);
                        (result, ctx)
                    })
                    .await
                    .map_err(SessionError::PreRequestScript)?;
                ctx = updated;
                if !result.success {
                    let message = result.error.unwrap_or_default();
                    tracing::warn!(id = %request.id, error = %message, "Pre-request script failed");
                    return Err(SessionError::PreRequestScript(message));
                }
                tracing::debug!(id = %request.id, duration_ms = result.duration_ms, "Pre-request script ran");
                Some(result)
            }
            None => None,
        };

        if let Auth::Custom { script } = &ctx.request.auth {
            let script = script.clone();
            let snapshot = ctx.clone();
            let value = self
                .blocking(move |sandbox| sandbox.evaluate_signature(&script, &snapshot))
                .await
                .map_err(SessionError::SignatureScript)?
                .map_err(SessionError::SignatureScript)?;
            if ctx.request.header("Authorization").is_none() {
                ctx.request.headers.push(KeyValue::new("Authorization", value));
            }
        }

        let raw = build_raw_request(&ctx.request, &ctx.variables)?;
        let url = raw.url.clone();
        let sent = variables::expand_request(&ctx.request, &ctx.variables);

        let options = DispatchOptions::new(settings.default_timeout_ms).with_cancel(cancel);
        let start = Instant::now();
        let outcome = self.engine.dispatch(raw, &options).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let post_script = match (&outcome, non_empty(&request.scripts.post_response)) {
            (Ok(response), Some(script)) => {
                let mut job_ctx = ctx.clone();
                job_ctx.response = Some(response.clone());
                let result = self
                    .blocking(move |sandbox| {
                        let result = sandbox.run_post_response(&script, &mut job_ctx);
                        (result, job_ctx.variables)
                    })
                    .await;
                match result {
                    Ok((result, variables)) => {
                        ctx.variables = variables;
                        if !result.success {
                            tracing::warn!(id = %request.id, "Post-response script failed");
                        }
                        Some(result)
                    }
                    Err(message) => Some(ScriptResult {
                        success: false,
                        error: Some(message),
                        ..ScriptResult::default()
                    }),
                }
            }
            _ => None,
        };

        let entry = history_entry(request, &sent, url, &outcome, elapsed_ms);
        self.store.add_history_entry(&entry)?;
        self.store.enforce_retention(
            settings.history_expire_days,
            settings.max_history_size,
            Utc::now(),
        )?;

        self.absorb_variables(&merged, &ctx.variables);

        Ok(SendReport {
            request: ctx.request,
            outcome,
            pre_script,
            post_script,
            history_id: entry.id,
            variables: ctx.variables,
        })
    }

    /// Keep script writes in the session layer.
    fn absorb_variables(&mut self, before: &VarMap, after: &VarMap) {
        for (key, value) in after {
            if before.get(key) != Some(value) {
                self.session_vars.insert(key.clone(), value.clone());
            }
        }
        self.session_vars.retain(|key, _| after.contains_key(key));
    }

    /// Scripts block their caller for up to the budget, so keep them off
    /// the async workers.
    async fn blocking<T, F>(&self, job: F) -> std::result::Result<T, String>
    where
        F: FnOnce(&ScriptSandbox) -> T + Send + 'static,
        T: Send + 'static,
    {
        let sandbox = self.scripts.clone();
        tokio::task::spawn_blocking(move || job(&sandbox))
            .await
            .map_err(|e| format!("Script task failed: {}", e))
    }
}

fn non_empty(script: &Option<String>) -> Option<String> {
    script.as_ref().filter(|s| !s.trim().is_empty()).cloned()
}

fn history_entry(
    request: &Request,
    sent: &Request,
    url: String,
    outcome: &std::result::Result<HttpResponse, DispatchError>,
    elapsed_ms: u64,
) -> HistoryEntry {
    let mut entry = HistoryEntry {
        id: new_id(),
        request_id: Some(request.id.clone()),
        collection_id: request.collection_id.clone(),
        method: request.method,
        url,
        name: request.name.clone(),
        status: None,
        response_time_ms: elapsed_ms,
        response_size: 0,
        executed_at: Utc::now(),
        curl: curl::to_curl(sent),
        response_body: None,
        response_headers: Vec::new(),
        error: None,
    };
    match outcome {
        Ok(response) => {
            entry.status = Some(response.status);
            entry.response_time_ms = response.response_time_ms;
            entry.response_size = response.size_bytes;
            entry.response_body = Some(response.body.clone());
            entry.response_headers = response.headers.clone();
        }
        Err(error) => {
            entry.error = Some(HistoryError {
                code: error.kind.code().to_string(),
                message: error.message.clone(),
            });
        }
    }
    entry
}

fn remove_ref(items: &mut Vec<CollectionItem>, request_id: &str) -> bool {
    let before = items.len();
    items.retain(|item| !matches!(item, CollectionItem::Request(r) if r.id == request_id));
    if items.len() != before {
        return true;
    }
    items.iter_mut().any(|item| match item {
        CollectionItem::Folder(folder) => remove_ref(&mut folder.items, request_id),
        CollectionItem::Request(_) => false,
    })
}
