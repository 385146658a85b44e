//! Index-linked lists over the task table
//!
//! The ready queue, the active task list and every task's sender list are
//! doubly linked lists threaded through per-slot [`Link`]s. Links live in
//! plain arrays indexed by slot, so insert and remove are O(1) without
//! embedded pointers. Each link records which list owns it; a slot can be
//! in at most one list per link array.

/// Identifies a list, so membership can be checked in O(1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListOwner {
    Ready,
    Active,
    /// Sender list of the task in this slot
    Senders(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    owner: Option<ListOwner>,
}

impl Link {
    pub fn owner(&self) -> Option<ListOwner> {
        self.owner
    }
}

#[derive(Debug)]
pub(crate) struct List {
    owner: ListOwner,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    pub const fn new(owner: ListOwner) -> Self {
        Self {
            owner,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, links: &[Link], index: usize) -> bool {
        links[index].owner == Some(self.owner)
    }

    pub fn push_back(&mut self, links: &mut [Link], index: usize) {
        assert!(
            links[index].owner.is_none(),
            "slot {} is already linked into {:?}",
            index,
            links[index].owner
        );

        links[index] = Link {
            prev: self.tail,
            next: None,
            owner: Some(self.owner),
        };
        match self.tail {
            Some(tail) => links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<usize> {
        let head = self.head?;
        self.unlink(links, head);
        Some(head)
    }

    /// Remove `index` if it is in this list
    pub fn remove(&mut self, links: &mut [Link], index: usize) -> bool {
        if !self.contains(links, index) {
            return false;
        }
        self.unlink(links, index);
        true
    }

    pub fn iter<'a>(&self, links: &'a [Link]) -> Iter<'a> {
        Iter {
            links,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, links: &mut [Link], index: usize) {
        let Link { prev, next, .. } = links[index];
        match prev {
            Some(prev) => links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => links[next].prev = prev,
            None => self.tail = prev,
        }
        links[index] = Link::default();
        self.len -= 1;
    }
}

pub(crate) struct Iter<'a> {
    links: &'a [Link],
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.cursor?;
        self.cursor = self.links[current].next;
        Some(current)
    }
}
