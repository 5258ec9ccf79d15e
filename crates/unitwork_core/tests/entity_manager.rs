mod common;

use common::{memory_coordinator, recorder, Project, Task};
use unitwork_core::{
    ChangeKind, ChangeMask, EntityManager, EntityRef, ManagerError, StorageError,
};

#[test]
fn add_stamps_dates_and_assigns_ids() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let task = EntityRef::new(Task::named("stamp"));

    tasks.add(&[task.clone()]).unwrap();

    let state = task.read();
    assert!(state.id.is_some());
    assert!(state.creation_date.is_some());
    assert_eq!(state.creation_date, state.modification_date);
    assert_eq!(state.archived_date, None);
}

#[test]
fn update_persists_fields_and_refreshes_modification_date() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let task = EntityRef::new(Task::named("draft"));
    tasks.add(&[task.clone()]).unwrap();
    task.write().modification_date = Some(0);

    task.write().name = Some("final".to_string());
    tasks.update(&[task.clone()]).unwrap();

    let stored = tasks.get(task.id().unwrap()).unwrap().unwrap();
    assert_eq!(stored.read().name.as_deref(), Some("final"));
    assert!(stored.read().modification_date.unwrap() > 0);
}

#[test]
fn archive_moves_records_between_list_and_list_archived() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let keep = EntityRef::new(Task::named("keep"));
    let shelve = EntityRef::new(Task::named("shelve"));
    tasks.add(&[keep.clone(), shelve.clone()]).unwrap();
    assert_eq!(tasks.size().unwrap(), 2);

    tasks.archive(&[shelve.clone()]).unwrap();

    assert!(shelve.read().archived_date.is_some());
    let active: Vec<Option<String>> = tasks
        .list()
        .unwrap()
        .iter()
        .map(|task| task.read().name.clone())
        .collect();
    assert_eq!(active, vec![Some("keep".to_string())]);
    assert_eq!(tasks.size().unwrap(), 1);

    let archived = tasks.list_archived().unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id(), shelve.id());
}

#[test]
fn archived_records_cannot_be_changed() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let task = EntityRef::new(Task::named("frozen"));
    tasks.add(&[task.clone()]).unwrap();
    tasks.archive(&[task.clone()]).unwrap();

    task.write().name = Some("thawed".to_string());
    for result in [
        tasks.update(&[task.clone()]),
        tasks.remove(&[task.clone()]),
        tasks.add(&[task.clone()]),
    ] {
        match result.unwrap_err() {
            ManagerError::ArchivedRecord { kind, id } => {
                assert_eq!(kind, "Task");
                assert_eq!(id, task.id());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    let stored = tasks.get(task.id().unwrap()).unwrap().unwrap();
    assert_eq!(stored.read().name.as_deref(), Some("frozen"));
}

#[test]
fn batch_is_all_or_nothing() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let (observer, seen) = recorder();
    tasks.subscribe(ChangeMask::ALL, observer).unwrap();

    let fine = EntityRef::new(Task::named("fine"));
    let archived = EntityRef::new(Task::named("archived"));
    archived.write().archived_date = Some(42);

    assert!(tasks.add(&[fine.clone(), archived]).is_err());
    assert!(seen.lock().is_empty());
    assert_eq!(tasks.size().unwrap(), 0);
    assert!(tasks.list_archived().unwrap().is_empty());
}

#[test]
fn removing_an_unsaved_record_reports_the_storage_cause() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);

    let err = tasks
        .remove(&[EntityRef::new(Task::named("never saved"))])
        .unwrap_err();

    assert!(matches!(
        err,
        ManagerError::Storage(StorageError::NotPersisted { kind: "Task" })
    ));
    assert!(err
        .root_cause()
        .to_string()
        .contains("has no identity yet"));
}

#[test]
fn updating_a_deleted_row_is_not_found() {
    let coordinator = memory_coordinator();
    let projects = EntityManager::<Project>::new(&coordinator);
    let project = EntityRef::new(Project::named("short-lived"));
    projects.add(&[project.clone()]).unwrap();
    let twin = projects.get(project.id().unwrap()).unwrap().unwrap();
    projects.remove(&[project]).unwrap();

    let err = projects.update(&[twin]).unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Storage(StorageError::NotFound {
            kind: "Project",
            ..
        })
    ));
}

#[test]
fn non_archivable_kinds_list_everything() {
    let coordinator = memory_coordinator();
    let projects = EntityManager::<Project>::new(&coordinator);
    projects
        .add(&[
            EntityRef::new(Project::named("a")),
            EntityRef::new(Project::named("b")),
        ])
        .unwrap();

    assert_eq!(projects.size().unwrap(), 2);
    assert_eq!(projects.list().unwrap().len(), 2);
    assert!(projects.list_archived().unwrap().is_empty());
}

#[test]
fn empty_batches_do_not_open_a_transaction() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let (observer, seen) = recorder();
    tasks.subscribe(ChangeMask::ALL, observer).unwrap();

    tasks.add(&[]).unwrap();
    tasks.update(&[]).unwrap();
    tasks.remove(&[]).unwrap();
    tasks.archive(&[]).unwrap();

    assert!(seen.lock().is_empty());
}

#[test]
fn each_manager_call_dispatches_one_group_per_change() {
    let coordinator = memory_coordinator();
    let tasks = EntityManager::<Task>::new(&coordinator);
    let (observer, seen) = recorder();
    tasks.subscribe(ChangeMask::ALL, observer).unwrap();

    let batch: Vec<EntityRef<Task>> = ["a", "b", "c"]
        .iter()
        .map(|name| EntityRef::new(Task::named(name)))
        .collect();
    tasks.add(&batch).unwrap();
    tasks.archive(&batch[..2]).unwrap();
    tasks.remove(&batch[2..]).unwrap();

    let summary: Vec<(ChangeKind, usize)> = seen
        .lock()
        .iter()
        .map(|group| (group.change, group.entities.len()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ChangeKind::Created, 3),
            (ChangeKind::Updated, 2),
            (ChangeKind::Removed, 1),
        ]
    );
}
