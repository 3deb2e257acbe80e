/// Async Session Module
///
/// `AsyncSession` exposes the `Session` operations as futures. Each call runs
/// the blocking engine on tokio's blocking pool, so the awaiting task is
/// suspended only while the database work runs. Arguments are cloned (or
/// serialized to JSON) before the work is handed off.
use crate::bulk::{ColumnSelection, TableBuffer};
use crate::core::db::{CommandSpec, Entity, Outcome};
use crate::core::value::{ParameterSet, RowSet, Value};
use crate::core::{RelError, Result};
use crate::crud::{ExistsPolicy, Query};
use crate::pagination::{PageRequest, PaginationResult, RowPage};
use crate::session::Session;
use crate::transaction::{StepResult, TransactionStep};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Suspending façade over a `Session`
#[derive(Debug, Clone)]
pub struct AsyncSession {
    session: Arc<Session>,
}

impl From<Session> for AsyncSession {
    fn from(session: Session) -> Self {
        AsyncSession::new(session)
    }
}

impl AsyncSession {
    pub fn new(session: Session) -> Self {
        AsyncSession {
            session: Arc::new(session),
        }
    }

    /// The wrapped blocking session
    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn spawn<R, F>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Session) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let session = Arc::clone(&self.session);
        match tokio::task::spawn_blocking(move || work(&session)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(RelError::driver(e)),
        }
    }

    pub async fn run(&self, command: &CommandSpec) -> Result<Outcome> {
        let command = command.clone();
        self.spawn(move |s| s.run(&command)).await
    }

    pub async fn execute(&self, command: &CommandSpec) -> Result<u64> {
        let command = command.clone();
        self.spawn(move |s| s.execute(&command)).await
    }

    pub async fn scalar(&self, command: &CommandSpec) -> Result<Value> {
        let command = command.clone();
        self.spawn(move |s| s.scalar(&command)).await
    }

    pub async fn query(&self, command: &CommandSpec) -> Result<RowSet> {
        let command = command.clone();
        self.spawn(move |s| s.query(&command)).await
    }

    pub async fn query_sets(&self, command: &CommandSpec) -> Result<Vec<RowSet>> {
        let command = command.clone();
        self.spawn(move |s| s.query_sets(&command)).await
    }

    pub async fn execute_raw(&self, sql: &str, params: &ParameterSet) -> Result<u64> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.spawn(move |s| s.execute_raw(&sql, &params)).await
    }

    pub async fn query_raw(&self, sql: &str, params: &ParameterSet) -> Result<RowSet> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.spawn(move |s| s.query_raw(&sql, &params)).await
    }

    pub async fn query_sets_raw(&self, sql: &str, params: &ParameterSet) -> Result<Vec<RowSet>> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.spawn(move |s| s.query_sets_raw(&sql, &params)).await
    }

    pub async fn scalar_raw(&self, sql: &str, params: &ParameterSet) -> Result<Value> {
        let (sql, params) = (sql.to_string(), params.clone());
        self.spawn(move |s| s.scalar_raw(&sql, &params)).await
    }

    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.spawn(move |s| s.execute_script(&sql)).await
    }

    pub async fn insert<T: Entity>(&self, entity: &T) -> Result<u64> {
        let data = serde_json::to_value(entity)?;
        self.spawn(move |s| s.insert_data(&data, &Query::<T>::new())).await
    }

    pub async fn insert_data<T: Entity, D: Serialize + ?Sized>(&self, data: &D, query: &Query<T>) -> Result<u64> {
        let (data, query) = (serde_json::to_value(data)?, query.clone());
        self.spawn(move |s| s.insert_data(&data, &query)).await
    }

    pub async fn insert_into<D: Serialize + ?Sized>(&self, table: &str, data: &D) -> Result<u64> {
        let (table, data) = (table.to_string(), serde_json::to_value(data)?);
        self.spawn(move |s| s.insert_into(&table, &data)).await
    }

    pub async fn update<T: Entity, D: Serialize + ?Sized>(&self, data: &D, query: &Query<T>) -> Result<u64> {
        let (data, query) = (serde_json::to_value(data)?, query.clone());
        self.spawn(move |s| s.update(&data, &query)).await
    }

    pub async fn update_entity<T: Entity + Clone>(&self, entity: &T) -> Result<u64> {
        let entity = entity.clone();
        self.spawn(move |s| s.update_entity(&entity)).await
    }

    pub async fn delete<T: Entity>(&self, query: &Query<T>) -> Result<u64> {
        let query = query.clone();
        self.spawn(move |s| s.delete(&query)).await
    }

    pub async fn delete_entity<T: Entity + Clone>(&self, entity: &T) -> Result<u64> {
        let entity = entity.clone();
        self.spawn(move |s| s.delete_entity(&entity)).await
    }

    pub async fn list<T: Entity>(&self, query: &Query<T>) -> Result<Vec<T>> {
        let query = query.clone();
        self.spawn(move |s| s.list(&query)).await
    }

    pub async fn single<T: Entity>(&self, query: &Query<T>) -> Result<Option<T>> {
        let query = query.clone();
        self.spawn(move |s| s.single(&query)).await
    }

    pub async fn count<T: Entity>(&self, query: &Query<T>) -> Result<u64> {
        let query = query.clone();
        self.spawn(move |s| s.count(&query)).await
    }

    pub async fn exists<T: Entity>(&self, query: &Query<T>, policy: ExistsPolicy) -> Result<bool> {
        let query = query.clone();
        self.spawn(move |s| s.exists(&query, policy)).await
    }

    pub async fn first<T: Entity, K: DeserializeOwned + Send + 'static>(&self, path: &str, query: &Query<T>) -> Result<Option<K>> {
        let (path, query) = (path.to_string(), query.clone());
        self.spawn(move |s| s.first(&path, &query)).await
    }

    pub async fn paginate<T: Entity>(&self, query: &Query<T>, request: &PageRequest) -> Result<PaginationResult<T>> {
        let (query, request) = (query.clone(), request.clone());
        self.spawn(move |s| s.paginate(&query, &request)).await
    }

    pub async fn paginate_command(&self, command: &CommandSpec, request: &PageRequest) -> Result<RowPage> {
        let (command, request) = (command.clone(), request.clone());
        self.spawn(move |s| s.paginate_command(command, &request)).await
    }

    pub async fn bulk_import(&self, table: &str, buffer: TableBuffer) -> Result<u64> {
        let table = table.to_string();
        self.spawn(move |s| s.bulk_import(&table, &buffer)).await
    }

    pub async fn bulk_import_entities<T: Entity + Clone>(
        &self,
        entities: &[T],
        selection: ColumnSelection<'static>,
    ) -> Result<u64> {
        let entities = entities.to_vec();
        self.spawn(move |s| s.bulk_import_entities(&entities, selection)).await
    }

    /// Runs `steps` atomically and returns the last step's result
    pub async fn run_steps(&self, steps: &[TransactionStep]) -> Result<StepResult> {
        let steps = steps.to_vec();
        self.spawn(move |s| s.run_steps(&steps)).await
    }

    /// Runs `work` inside one transaction on the blocking pool
    pub async fn transaction<R, F>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&mut crate::core::db::Executor<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn(move |s| s.transaction(work)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{field, OrderBy};
    use crate::test_utils::{Person, TestDb};

    #[tokio::test]
    async fn test_async_crud_matches_blocking_semantics() {
        let db = TestDb::new();
        let session = AsyncSession::new(db.session());

        session
            .insert(&Person {
                name: "Ann".to_string(),
                age: 30,
                ..Default::default()
            })
            .await
            .unwrap();
        session
            .insert_into("people", &serde_json::json!({"Name": "Bob", "Age": 41}))
            .await
            .unwrap();

        let query = Query::<Person>::new()
            .filter(field("Age").gt(20))
            .order(OrderBy::desc("Age"));
        let people = session.list(&query).await.unwrap();
        assert_eq!(people.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["Bob", "Ann"]);
        assert_eq!(session.count(&query).await.unwrap(), 2);
        assert_eq!(db.session().count(&query).unwrap(), 2);

        let page = session.paginate(&query, &PageRequest::new(2, 1)).await.unwrap();
        assert_eq!(page.rows[0].name, "Ann");
        assert_eq!(page.page_count, 2);
    }

    #[tokio::test]
    async fn test_async_batch_returns_each_result_set() {
        let db = TestDb::new();
        db.seed(&[("Ann", 30), ("Bob", 41)]);
        let session = AsyncSession::new(db.session());

        let sets = session
            .query_sets_raw(
                "select Name from people where Age > @Age order by Name; select count(*) from people",
                &ParameterSet::new().with_value("Age", 35),
            )
            .await
            .unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].rows, vec![vec![Value::from("Bob")]]);
        assert_eq!(sets[1].scalar(), Value::Integer(2));
    }

    #[tokio::test]
    async fn test_async_errors_propagate_unchanged() {
        let db = TestDb::new();
        let session = AsyncSession::from(db.session());
        assert!(matches!(
            session.delete(&Query::<Person>::new()).await,
            Err(RelError::Argument(_))
        ));
        assert!(matches!(
            session.execute_raw("insert into nowhere values(1)", &ParameterSet::new()).await,
            Err(RelError::Driver(_))
        ));
    }

    #[tokio::test]
    async fn test_async_steps_and_transaction() {
        let db = TestDb::new();
        let session = AsyncSession::new(db.session());

        let last = session
            .run_steps(&[
                TransactionStep::non_query("insert into people(Name, Age) values('Ann', 30)"),
                TransactionStep::scalar("select count(*) from people"),
            ])
            .await
            .unwrap();
        assert_eq!(last, StepResult::Scalar(Value::Integer(1)));

        let rolled_back: Result<u64> = session
            .transaction(|exec| {
                exec.execute_raw("delete from people", &ParameterSet::new())?;
                Err(RelError::Argument("undo".to_string()))
            })
            .await;
        assert!(rolled_back.is_err());
        assert_eq!(db.count_people(), 1);
    }
}
